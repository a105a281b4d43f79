//! The `DESCRIBE_PROTOCOL` negotiation state: status, the negotiated
//! support bitmasks, the protocol property maps, and the decision logic of
//! the timeout countdown task.

use crate::protocol::message_type::{
    legacy_bitmask, roster_index, MessageType, LEGACY_RECV, LEGACY_SEND, RECV_ROSTER, SEND_ROSTER,
};
use crate::{FeedError, FeedResult};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How long the client waits for a `DESCRIBE_PROTOCOL` response before
/// assuming the legacy message set.
pub(crate) const DESCRIBE_PROTOCOL_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DescribeProtocolStatus {
    NotSent,
    Pending,
    Received,
    /// No response within the timeout; the legacy bitmasks are in effect.
    NotReceivedTimedOut,
}

/// Whether the negotiated protocol supports a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageSupport {
    Supported,
    NotSupported,
    /// The handshake is still in flight; retry once it resolves.
    Pending,
}

/// Outcome of one countdown-task poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimeoutPoll {
    /// Still pending; hold the queue.
    KeepWaiting,
    /// Resolved (response or timeout); the task is done.
    Done,
}

#[derive(Debug)]
pub(crate) struct ProtocolState {
    status: DescribeProtocolStatus,
    /// Bumped on every `mark_sent`; countdown tasks carry the generation
    /// they were armed for and pop when a newer session supersedes them.
    generation: u64,
    sent_at: Option<Instant>,
    /// Bit `i` set: the server receives `SEND_ROSTER[i]`.
    send_mask: u32,
    /// Bit `i` set: the server sends `RECV_ROSTER[i]`.
    recv_mask: u32,
    /// Properties this client announces.
    properties: BTreeMap<String, String>,
    /// Properties the server announced.
    server_properties: BTreeMap<String, String>,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolState {
    pub fn new() -> Self {
        Self {
            status: DescribeProtocolStatus::NotSent,
            generation: 0,
            sent_at: None,
            send_mask: 0,
            recv_mask: 0,
            properties: BTreeMap::new(),
            server_properties: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> DescribeProtocolStatus {
        self.status
    }

    /// Drops all server-negotiated state; called when a connection is
    /// (re-)established.
    pub fn clear(&mut self) {
        self.status = DescribeProtocolStatus::NotSent;
        self.sent_at = None;
        self.send_mask = 0;
        self.recv_mask = 0;
        self.server_properties.clear();
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn server_properties(&self) -> &BTreeMap<String, String> {
        &self.server_properties
    }

    pub fn set_server_property(&mut self, key: String, value: String) {
        self.server_properties.insert(key, value);
    }

    /// Registers that `DESCRIBE_PROTOCOL` has been scheduled for sending;
    /// returns the generation the accompanying countdown task is armed
    /// for.
    ///
    /// The countdown starts here, not at the moment the bytes leave, so a
    /// stalled task queue counts against the server the same way a
    /// stalled worker queue would.
    pub fn mark_sent(&mut self, now: Instant) -> FeedResult<u64> {
        match self.status {
            DescribeProtocolStatus::Pending | DescribeProtocolStatus::NotReceivedTimedOut => {
                // these states can only follow a previous mark_sent
                Err(FeedError::Impl("DESCRIBE_PROTOCOL sent twice"))
            }
            DescribeProtocolStatus::NotSent => {
                self.generation += 1;
                self.sent_at = Some(now);
                self.status = DescribeProtocolStatus::Pending;
                Ok(self.generation)
            }
            // The response can overtake this call; nothing to do then.
            DescribeProtocolStatus::Received => Ok(self.generation),
        }
    }

    /// The countdown task body: resolves the pending state to
    /// `NotReceivedTimedOut` with the legacy bitmasks once the timeout
    /// elapses. A task armed for a superseded generation, or outliving a
    /// cleared session, has nothing left to wait for.
    pub fn poll_timeout(&mut self, now: Instant, generation: u64) -> FeedResult<TimeoutPoll> {
        if generation != self.generation {
            return Ok(TimeoutPoll::Done);
        }
        match self.status {
            DescribeProtocolStatus::NotSent
            | DescribeProtocolStatus::NotReceivedTimedOut
            | DescribeProtocolStatus::Received => Ok(TimeoutPoll::Done),
            DescribeProtocolStatus::Pending => {
                let sent_at = self.sent_at.ok_or(FeedError::Impl("pending without timestamp"))?;
                if now.duration_since(sent_at) < DESCRIBE_PROTOCOL_TIMEOUT {
                    return Ok(TimeoutPoll::KeepWaiting);
                }
                self.status = DescribeProtocolStatus::NotReceivedTimedOut;
                self.send_mask = legacy_bitmask(SEND_ROSTER, LEGACY_SEND);
                self.recv_mask = legacy_bitmask(RECV_ROSTER, LEGACY_RECV);
                Ok(TimeoutPoll::Done)
            }
        }
    }

    /// Called when a `DESCRIBE_PROTOCOL` response starts processing.
    ///
    /// A late response after the timeout returns the connection from the
    /// legacy state: the masks are re-cleared so the message lists fill
    /// them out. A response within the window leaves the (empty) masks
    /// alone.
    pub fn begin_receipt(&mut self) {
        if self.status == DescribeProtocolStatus::NotReceivedTimedOut {
            self.send_mask = 0;
            self.recv_mask = 0;
        }
        self.status = DescribeProtocolStatus::Received;
    }

    /// Records one entry of the server's "sends" list: it maps onto the
    /// messages this client receives.
    pub fn note_server_sends(&mut self, id: i32, name: &str) {
        if let Some(idx) = Self::match_roster(RECV_ROSTER, id, name) {
            self.recv_mask |= 1 << idx;
        }
    }

    /// Records one entry of the server's "receives" list: it maps onto the
    /// messages this client sends.
    pub fn note_server_receives(&mut self, id: i32, name: &str) {
        if let Some(idx) = Self::match_roster(SEND_ROSTER, id, name) {
            self.send_mask |= 1 << idx;
        }
    }

    fn match_roster(roster: &[MessageType], id: i32, name: &str) -> Option<usize> {
        let msg = MessageType::try_from_wire(i64::from(id))?;
        let idx = roster_index(roster, msg)?;
        // the id exists in the roster, but the names must agree too
        if msg.wire_name() != name {
            return None;
        }
        Some(idx)
    }

    pub fn message_support(&self, msg: MessageType) -> FeedResult<MessageSupport> {
        match self.status {
            DescribeProtocolStatus::NotSent => {
                Err(FeedError::Impl("message support queried before handshake"))
            }
            DescribeProtocolStatus::Pending => Ok(MessageSupport::Pending),
            DescribeProtocolStatus::Received | DescribeProtocolStatus::NotReceivedTimedOut => {
                let in_send = roster_index(SEND_ROSTER, msg)
                    .is_some_and(|i| self.send_mask & (1 << i) != 0);
                let in_recv = roster_index(RECV_ROSTER, msg)
                    .is_some_and(|i| self.recv_mask & (1 << i) != 0);
                if in_send || in_recv {
                    Ok(MessageSupport::Supported)
                } else {
                    Ok(MessageSupport::NotSupported)
                }
            }
        }
    }
}
