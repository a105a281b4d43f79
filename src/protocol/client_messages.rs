//! Outbound protocol operations: frame composers plus the task-or-direct
//! send paths used by the public API and by the reconnect refresher.
//!
//! Every operation exists in two modes, mirroring the engine's threading
//! contract: called with `task_mode == false` it only enqueues itself on
//! the connection's task queue; the task-runner thread re-enters it with
//! `task_mode == true` and performs the actual sends.

use crate::conn::{ConnectionCore, TaskCommand, TaskResult};
use crate::events::{EventType, EventTypes, SpecialSource};
use crate::last_error::set_last_error;
use crate::protocol::describe_protocol::MessageSupport;
use crate::protocol::message_type::{MessageType, RECV_ROSTER, SEND_ROSTER};
use crate::protocol::{write_symbol, encode_symbol, FrameBuilder};
use crate::records::RecordId;
use crate::subscription::{SubscriptionFlags, SubscriptionSnapshot};
use crate::{FeedError, FeedResult, PROTOCOL_VERSION};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Which delivery channel a record subscribes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubscriptionKind {
    Ticker,
    Stream,
    History,
}

impl SubscriptionKind {
    fn message(self, unsubscribe: bool) -> MessageType {
        match (self, unsubscribe) {
            (Self::Ticker, false) => MessageType::TickerAddSubscription,
            (Self::Ticker, true) => MessageType::TickerRemoveSubscription,
            (Self::Stream, false) => MessageType::StreamAddSubscription,
            (Self::Stream, true) => MessageType::StreamRemoveSubscription,
            (Self::History, false) => MessageType::HistoryAddSubscription,
            (Self::History, true) => MessageType::HistoryRemoveSubscription,
        }
    }
}

/// Everything one (un)subscribe operation carries onto the wire.
#[derive(Clone, Debug)]
pub(crate) struct SubscribeRequest {
    pub symbols: Vec<String>,
    pub event_types: EventTypes,
    pub flags: SubscriptionFlags,
    pub time: i64,
    pub raw_sources: Vec<String>,
    pub groups: Vec<SpecialSource>,
    pub unsubscribe: bool,
}

impl SubscribeRequest {
    pub fn from_snapshot(
        snapshot: &SubscriptionSnapshot,
        symbols: Vec<String>,
        unsubscribe: bool,
    ) -> Self {
        Self {
            symbols,
            event_types: snapshot.event_types,
            flags: snapshot.flags,
            time: snapshot.time,
            raw_sources: snapshot.raw_sources.clone(),
            groups: snapshot.groups.clone(),
            unsubscribe,
        }
    }
}

/// The history subscription time floor: seconds in the high word, the
/// millisecond remainder in the low word.
fn subscription_time(time_millis: i64) -> i64 {
    let seconds = time_millis / 1000;
    let millis = time_millis % 1000;
    (seconds << 32) | millis
}

/// Resolves the `(record, channel)` pairs an event requires, registering
/// dynamic per-source order records as needed.
fn subscription_params(
    core: &ConnectionCore,
    event: EventType,
    request: &SubscribeRequest,
) -> FeedResult<Vec<(RecordId, SubscriptionKind)>> {
    fn push(params: &mut Vec<(RecordId, SubscriptionKind)>, param: (RecordId, SubscriptionKind)) {
        if !params.contains(&param) {
            params.push(param);
        }
    }
    let time_series = request.flags.contains(SubscriptionFlags::TIME_SERIES);
    let mut registry = core.registry().lock()?;
    let mut params: Vec<(RecordId, SubscriptionKind)> = Vec::new();
    match event {
        EventType::Trade => {
            let id = registry.find_by_name("Trade").ok_or(FeedError::Impl("Trade record missing"))?;
            push(&mut params, (id, SubscriptionKind::Ticker));
        }
        EventType::Quote => {
            let id = registry.find_by_name("Quote").ok_or(FeedError::Impl("Quote record missing"))?;
            push(&mut params, (id, SubscriptionKind::Ticker));
        }
        EventType::Summary => {
            let id = registry
                .find_by_name("Summary")
                .ok_or(FeedError::Impl("Summary record missing"))?;
            push(&mut params, (id, SubscriptionKind::Ticker));
        }
        EventType::Profile => {
            let id = registry
                .find_by_name("Profile")
                .ok_or(FeedError::Impl("Profile record missing"))?;
            push(&mut params, (id, SubscriptionKind::Ticker));
        }
        EventType::TimeAndSale => {
            let id = registry
                .find_by_name("TimeAndSale")
                .ok_or(FeedError::Impl("TimeAndSale record missing"))?;
            let kind = if request.flags.contains(SubscriptionFlags::SINGLE_RECORD) {
                SubscriptionKind::Ticker
            } else if time_series {
                SubscriptionKind::History
            } else {
                SubscriptionKind::Stream
            };
            push(&mut params, (id, kind));
        }
        EventType::Order => {
            for source in &request.raw_sources {
                let id = registry.ensure_order_record(source);
                push(&mut params, (id, SubscriptionKind::Ticker));
            }
            for group in &request.groups {
                let name = match group {
                    SpecialSource::Composite | SpecialSource::Regional => "Quote",
                    SpecialSource::Aggregate => "MarketMaker",
                    _ => continue,
                };
                let id = registry
                    .find_by_name(name)
                    .ok_or(FeedError::Impl("group base record missing"))?;
                push(&mut params, (id, SubscriptionKind::Ticker));
            }
        }
    }
    Ok(params)
}

/// Combined server support over every message the request would send.
///
/// Mixing messages with resolved and pending support in one operation is
/// refused; a single unsupported message makes the whole operation
/// unsupported.
fn event_server_support(
    core: &ConnectionCore,
    request: &SubscribeRequest,
) -> FeedResult<MessageSupport> {
    let mut overall: Option<MessageSupport> = None;
    for event in request.event_types.iter() {
        let params = subscription_params(core, event, request)?;
        let protocol = core.protocol().lock()?;
        for (_, kind) in params {
            let support = protocol.message_support(kind.message(request.unsubscribe))?;
            match overall {
                None => overall = Some(support),
                Some(prev) if prev == support => {}
                Some(prev) => {
                    if prev == MessageSupport::Pending || support == MessageSupport::Pending {
                        return Err(FeedError::InconsistentMessageSupport);
                    }
                    return Ok(MessageSupport::NotSupported);
                }
            }
        }
    }
    Ok(overall.unwrap_or(MessageSupport::Supported))
}

/// Subscribes or unsubscribes symbols, gating on negotiated message
/// support. Outside task mode the operation defers itself to the task
/// queue, which cannot run it before the handshake resolves.
pub(crate) fn subscribe_symbols(
    core: &Arc<ConnectionCore>,
    request: SubscribeRequest,
    task_mode: bool,
) -> FeedResult<()> {
    match event_server_support(core, &request)? {
        MessageSupport::NotSupported => return Err(FeedError::LocalMessageNotSupportedByServer),
        MessageSupport::Pending if task_mode => {
            // the countdown task in front of us must have resolved this
            return Err(FeedError::Impl(
                "subscription task executed while the handshake is pending",
            ));
        }
        _ => {
            if !task_mode {
                let weak = Arc::downgrade(core);
                let mut request = Some(request);
                core.task_queue().add_task(Box::new(move |cmd| {
                    subscribe_task(&weak, &mut request, cmd)
                }));
                return Ok(());
            }
        }
    }

    // Announce any records the server has not seen before subscribing to
    // them.
    send_record_description(core, true)?;

    for symbol in &request.symbols {
        for event in request.event_types.iter() {
            let params = subscription_params(core, event, &request)?;
            for (record, kind) in params {
                let message = kind.message(request.unsubscribe);
                let mut frame = FrameBuilder::new(Some(message));
                let cipher = encode_symbol(symbol);
                write_symbol(frame.body(), cipher, Some(symbol.as_str()));
                let wire_id = core.registry().lock()?.wire_record_id(record);
                frame.body().write_compact_int(wire_id);
                if message == MessageType::HistoryAddSubscription {
                    frame.body().write_compact_long(subscription_time(request.time));
                }
                trace!(
                    "sending {} for {symbol} record {wire_id}",
                    message.wire_name()
                );
                core.send_data(&frame.finish())?;
            }
        }
    }
    Ok(())
}

fn subscribe_task(
    core: &Weak<ConnectionCore>,
    request: &mut Option<SubscribeRequest>,
    cmd: TaskCommand,
) -> TaskResult {
    let done = TaskResult::new().pop_me();
    if cmd == TaskCommand::FreeResources {
        request.take();
        return done.success();
    }
    let (Some(core), Some(request)) = (core.upgrade(), request.take()) else {
        return done.success();
    };
    match subscribe_symbols(&core, request, true) {
        Ok(()) => done.success(),
        Err(e) => {
            error!("deferred subscription failed: {}", e.display_with_inner());
            set_last_error(e);
            done
        }
    }
}

/// Sends `DESCRIBE_PROTOCOL` (task mode), or enqueues the sender task and
/// starts the response countdown.
pub(crate) fn send_protocol_description(
    core: &Arc<ConnectionCore>,
    task_mode: bool,
) -> FeedResult<()> {
    if !task_mode {
        let weak = Arc::downgrade(core);
        core.task_queue().add_task(Box::new(move |cmd| {
            simple_send_task(&weak, cmd, |core| send_protocol_description(core, true))
        }));
        // The countdown starts now and blocks everything queued after it
        // until the handshake resolves one way or the other.
        let generation = core.protocol().lock()?.mark_sent(Instant::now())?;
        let weak = Arc::downgrade(core);
        core.task_queue().add_task(Box::new(move |cmd| {
            countdown_task(&weak, generation, cmd)
        }));
        return Ok(());
    }

    let mut frame = FrameBuilder::new(Some(MessageType::DescribeProtocol));
    {
        let mut protocol = core.protocol().lock()?;
        protocol.set_property("version", PROTOCOL_VERSION);
        protocol.set_property("opt", "hs");

        let body = frame.body();
        // magic
        body.write_byte(b'D');
        body.write_byte(b'X');
        body.write_byte(b'P');
        body.write_byte(b'3');
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        body.write_compact_int(protocol.properties().len() as i32);
        for (key, value) in protocol.properties() {
            body.write_utf_string(Some(key));
            body.write_utf_string(Some(value));
        }
        for roster in [SEND_ROSTER, RECV_ROSTER] {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            body.write_compact_int(roster.len() as i32);
            for msg in roster {
                body.write_compact_int(msg.id());
                body.write_utf_string(Some(msg.wire_name()));
                body.write_compact_int(0); // message properties
            }
        }
    }
    debug!("sending DESCRIBE_PROTOCOL");
    core.send_data(&frame.finish())
}

fn countdown_task(core: &Weak<ConnectionCore>, generation: u64, cmd: TaskCommand) -> TaskResult {
    use crate::protocol::describe_protocol::TimeoutPoll;
    if cmd == TaskCommand::FreeResources {
        return TaskResult::new().success().pop_me();
    }
    let Some(core) = core.upgrade() else {
        return TaskResult::new().success().pop_me();
    };
    let poll = core
        .protocol()
        .lock()
        .map_err(FeedError::from)
        .and_then(|mut p| p.poll_timeout(Instant::now(), generation));
    match poll {
        Ok(TimeoutPoll::KeepWaiting) => TaskResult::new().success().dont_advance(),
        Ok(TimeoutPoll::Done) => TaskResult::new().success().pop_me(),
        Err(e) => {
            set_last_error(e);
            TaskResult::new().dont_advance()
        }
    }
}

/// Sends `DESCRIBE_RECORDS` for every record not yet announced (task
/// mode), or enqueues the sender task.
pub(crate) fn send_record_description(core: &Arc<ConnectionCore>, task_mode: bool) -> FeedResult<()> {
    if !task_mode {
        let weak = Arc::downgrade(core);
        core.task_queue().add_task(Box::new(move |cmd| {
            simple_send_task(&weak, cmd, |core| send_record_description(core, true))
        }));
        return Ok(());
    }

    let mut frame = FrameBuilder::new(Some(MessageType::DescribeRecords));
    {
        let mut registry = core.registry().lock()?;
        let pending = registry.take_undescribed();
        if pending.is_empty() {
            return Ok(());
        }
        let body = frame.body();
        for id in pending {
            let record = registry.record(id);
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            body.write_compact_int(id as i32);
            body.write_utf_string(Some(&record.name));
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            body.write_compact_int(record.fields.len() as i32);
            for field in record.fields {
                body.write_utf_string(Some(field.name));
                body.write_compact_int(field.field_type.0);
            }
        }
    }
    debug!("sending DESCRIBE_RECORDS");
    core.send_data(&frame.finish())
}

/// Sends a heartbeat (task mode: directly), or enqueues it.
pub(crate) fn send_heartbeat(core: &Arc<ConnectionCore>, task_mode: bool) -> FeedResult<()> {
    if !task_mode {
        let weak = Arc::downgrade(core);
        core.task_queue().add_task(Box::new(move |cmd| {
            simple_send_task(&weak, cmd, |core| send_heartbeat(core, true))
        }));
        return Ok(());
    }
    core.send_data(&FrameBuilder::new(None).finish())
}

/// Shared shape of the one-shot sender tasks: pop after one execution,
/// succeed only when the send succeeded.
fn simple_send_task(
    core: &Weak<ConnectionCore>,
    cmd: TaskCommand,
    send: impl Fn(&Arc<ConnectionCore>) -> FeedResult<()>,
) -> TaskResult {
    let done = TaskResult::new().pop_me();
    if cmd == TaskCommand::FreeResources {
        return done.success();
    }
    let Some(core) = core.upgrade() else {
        return done.success();
    };
    match send(&core) {
        Ok(()) => done.success(),
        Err(e) => {
            warn!("deferred send failed: {}", e.display_with_inner());
            set_last_error(e);
            done
        }
    }
}
