//! The connection engine: address resolution with jittered backoff,
//! shuffled dialing, the socket reader thread, the task-runner thread with
//! its heartbeat deadline, reconnect-and-resubscribe, and ordered
//! teardown.

use crate::conn::{AddressList, FeedConfiguration, TaskQueue, TcpClient};
use crate::events::{EventData, EventType, EventTypes};
use crate::last_error::set_last_error;
use crate::protocol::{
    send_heartbeat, send_protocol_description, send_record_description, subscribe_symbols,
    InboundBuffer, MessageSupport, MessageType, ProtocolState, SubscribeRequest,
};
use crate::records::RecordRegistry;
use crate::runtime::RuntimeInner;
use crate::subscription::{Subscription, SubscriptionContext, SubscriptionFlags};
use crate::{FeedError, FeedResult};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

const READ_CHUNK_SIZE: usize = 1024;
const RECONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);
const SMALL_TIMEOUT: Duration = Duration::from_millis(25);
/// Granularity of interruptible sleeps on the engine threads.
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct ResolvedAddresses {
    endpoints: Vec<SocketAddr>,
    cur_index: usize,
    last_resolution: Option<Instant>,
}

#[derive(Debug, Default)]
struct ThreadHandles {
    reader: Option<JoinHandle<()>>,
    queue: Option<JoinHandle<()>>,
    reader_id: Option<ThreadId>,
    queue_id: Option<ThreadId>,
}

type TerminationNotifier = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) struct ConnectionCore {
    address: String,
    config: FeedConfiguration,
    runtime: Arc<RuntimeInner>,
    socket: Mutex<Option<TcpClient>>,
    resolved: Mutex<ResolvedAddresses>,
    task_queue: TaskQueue,
    subscriptions: SubscriptionContext,
    registry: Mutex<RecordRegistry>,
    protocol: Mutex<ProtocolState>,
    inbound: Mutex<InboundBuffer>,
    reader_state: AtomicBool,
    queue_state: AtomicBool,
    reader_stop: AtomicBool,
    queue_stop: AtomicBool,
    closed: AtomicBool,
    threads: Mutex<ThreadHandles>,
    last_received: Mutex<Instant>,
    termination_notifier: Mutex<Option<TerminationNotifier>>,
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("address", &self.address)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionCore {
    pub(crate) fn subscriptions(&self) -> &SubscriptionContext {
        &self.subscriptions
    }

    pub(crate) fn registry(&self) -> &Mutex<RecordRegistry> {
        &self.registry
    }

    pub(crate) fn protocol(&self) -> &Mutex<ProtocolState> {
        &self.protocol
    }

    pub(crate) fn task_queue(&self) -> &TaskQueue {
        &self.task_queue
    }

    pub(crate) fn inbound(&self) -> &Mutex<InboundBuffer> {
        &self.inbound
    }

    pub(crate) fn config(&self) -> &FeedConfiguration {
        &self.config
    }

    /// Writes one composed frame, whole, under the send mutex.
    pub(crate) fn send_data(&self, buffer: &[u8]) -> FeedResult<()> {
        if buffer.is_empty() {
            return Err(FeedError::Impl("attempted to send an empty buffer"));
        }
        let mut guard = self.socket.lock()?;
        let Some(client) = guard.as_mut() else {
            return Err(FeedError::ConnectionClosed);
        };
        client.writer().write_all(buffer)?;
        Ok(())
    }

    fn close_socket(&self) {
        if let Ok(mut guard) = self.socket.lock() {
            if let Some(client) = guard.take() {
                client.shutdown();
            }
        }
    }

    fn socket_present(&self) -> bool {
        self.socket.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn touch_last_received(&self) {
        if let Ok(mut t) = self.last_received.lock() {
            *t = Instant::now();
        }
    }

    fn last_received_elapsed(&self) -> Duration {
        self.last_received
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Sleeps before a re-resolution: a randomised backoff that keeps the
    /// time between resolutions in `[RECONNECT_TIMEOUT, 2·RECONNECT_TIMEOUT)`.
    /// Interruptible by the reader stop flag.
    fn sleep_before_resolve(&self) -> FeedResult<()> {
        let since_last = {
            let resolved = self.resolved.lock()?;
            resolved.last_resolution.map(|t| t.elapsed())
        };
        if let Some(since_last) = since_last {
            if since_last < RECONNECT_TIMEOUT {
                let remaining = RECONNECT_TIMEOUT - since_last;
                let factor = 1.0 + rand::thread_rng().gen::<f64>();
                let mut sleep_for = remaining.mul_f64(factor);
                while sleep_for > Duration::ZERO {
                    if self.reader_stop.load(Ordering::Acquire) {
                        return Err(FeedError::ConnectionClosed);
                    }
                    let slice = sleep_for.min(STOP_POLL);
                    std::thread::sleep(slice);
                    sleep_for -= slice;
                }
            }
        }
        self.resolved.lock()?.last_resolution = Some(Instant::now());
        Ok(())
    }

    /// Re-parses the address collection and resolves every entry,
    /// shuffling the resulting endpoints.
    fn resolve_address(&self) -> FeedResult<()> {
        self.sleep_before_resolve()?;
        let list = AddressList::parse(&self.address)?;
        let mut endpoints = Vec::new();
        let mut first_host = String::new();
        for entry in list.entries() {
            if entry.has_codecs() {
                return Err(FeedError::Usage(
                    "tls/gzip transports are not provided by this client; plug in a transport layer",
                ));
            }
            if first_host.is_empty() {
                first_host = entry.host().to_string();
            }
            match (entry.host(), entry.port()).to_socket_addrs() {
                Ok(addrs) => {
                    // IPv4 first, the default address family of the feed
                    let (v4, v6): (Vec<_>, Vec<_>) = addrs.partition(SocketAddr::is_ipv4);
                    endpoints.extend(v4);
                    endpoints.extend(v6);
                }
                Err(e) => {
                    warn!("failed to resolve {}: {e}", entry.host());
                }
            }
        }
        if endpoints.is_empty() {
            return Err(FeedError::HostNotFound { host: first_host });
        }
        endpoints.shuffle(&mut rand::thread_rng());
        let mut resolved = self.resolved.lock()?;
        resolved.endpoints = endpoints;
        resolved.cur_index = 0;
        Ok(())
    }

    /// Dials the resolved endpoints in order until one accepts; installs
    /// the socket and returns the reader's stream handle.
    fn connect_to_resolved(&self) -> FeedResult<TcpStream> {
        loop {
            if self.reader_stop.load(Ordering::Acquire) {
                return Err(FeedError::ConnectionClosed);
            }
            let target = {
                let mut resolved = self.resolved.lock()?;
                if resolved.cur_index >= resolved.endpoints.len() {
                    return Err(FeedError::ConnectionClosed);
                }
                let target = resolved.endpoints[resolved.cur_index];
                resolved.cur_index += 1;
                target
            };
            match TcpClient::try_new(target) {
                Ok(client) => {
                    debug!("connected to {target}");
                    let reader = client.reader()?;
                    *self.socket.lock()? = Some(client);
                    self.touch_last_received();
                    return Ok(reader);
                }
                Err(e) => {
                    info!("connect to {target} failed: {}", e.display_with_inner());
                }
            }
        }
    }

    /// Drops every piece of server-negotiated state ahead of a new
    /// session on the same connection.
    fn clear_server_info(&self) -> FeedResult<()> {
        self.registry.lock()?.clear_server_info();
        self.protocol.lock()?.clear();
        *self.inbound.lock()? = InboundBuffer::new();
        Ok(())
    }

    /// The reconnect branch, run on the reader thread: dial (retrying the
    /// previously resolved endpoints before resolving anew), then replay
    /// the handshake and every live subscription.
    fn reestablish(self: &Arc<Self>) -> FeedResult<TcpStream> {
        self.clear_server_info()?;
        let reader = match self.connect_to_resolved() {
            Ok(reader) => reader,
            Err(FeedError::ConnectionClosed) if self.reader_stop.load(Ordering::Acquire) => {
                return Err(FeedError::ConnectionClosed);
            }
            Err(_) => {
                // the previously resolved endpoints are exhausted
                self.resolve_address()?;
                self.connect_to_resolved()?
            }
        };
        send_protocol_description(self, false)?;
        send_record_description(self, false)?;
        for snapshot in self.subscriptions.all_snapshots()? {
            if snapshot.symbols.is_empty() {
                continue;
            }
            let symbols = snapshot.symbols.clone();
            let request = SubscribeRequest::from_snapshot(&snapshot, symbols, false);
            subscribe_symbols(self, request, false)?;
        }
        Ok(reader)
    }

    fn notify_termination(&self) {
        if let Ok(notifier) = self.termination_notifier.lock() {
            if let Some(notifier) = notifier.as_ref() {
                notifier(&self.address);
            }
        }
    }

    /// True unless the caller is one of the connection's own threads, in
    /// which case teardown must be deferred to an outside thread.
    fn can_deinit(&self) -> bool {
        let current = std::thread::current().id();
        match self.threads.lock() {
            Ok(handles) => {
                handles.reader_id != Some(current) && handles.queue_id != Some(current)
            }
            Err(_) => true,
        }
    }

    /// Tears the connection down: the task runner is signalled and joined
    /// first so no outbound work races the socket close, then the socket
    /// is shut down to unblock the reader, the reader joined, and the
    /// remaining tasks released.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing connection to {}", self.address);
        self.queue_stop.store(true, Ordering::Release);
        let queue = self.threads.lock().ok().and_then(|mut h| h.queue.take());
        if let Some(handle) = queue {
            if handle.join().is_err() {
                error!("task-runner thread panicked");
            }
            trace!("task-runner thread exited");
        }
        self.reader_stop.store(true, Ordering::Release);
        self.close_socket();
        let reader = self.threads.lock().ok().and_then(|mut h| h.reader.take());
        if let Some(handle) = reader {
            if handle.join().is_err() {
                error!("reader thread panicked");
            }
            trace!("reader thread exited");
        }
        self.task_queue.destroy();
    }
}

// ---------------------------------------------------------------------------
// engine threads
// ---------------------------------------------------------------------------

/// The socket reader: blocks on `recv`, feeds the inbound engine, and owns
/// the reconnect branch. User callbacks run on this thread.
fn reader_loop(core: &Arc<ConnectionCore>, mut stream: Option<TcpStream>) {
    core.reader_state.store(true, Ordering::Release);
    let mut idle = false;
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        if core.reader_stop.load(Ordering::Acquire) {
            break;
        }
        if core.reader_state.load(Ordering::Acquire) && !core.queue_state.load(Ordering::Acquire) {
            // the task runner hit a fault; take over with a reconnect
            core.reader_state.store(false, Ordering::Release);
            core.queue_state.store(true, Ordering::Release);
        }
        if !core.reader_state.load(Ordering::Acquire) && !idle {
            core.notify_termination();
            idle = true;
            stream = None;
            core.close_socket();
        }
        if idle {
            if !core.config.reestablish_connections() {
                warn!("connection to {} lost; reconnects are disabled", core.address);
                break;
            }
            match core.reestablish() {
                Ok(new_stream) => {
                    info!("connection to {} re-established", core.address);
                    stream = Some(new_stream);
                    core.reader_state.store(true, Ordering::Release);
                    idle = false;
                }
                Err(FeedError::ConnectionClosed) => continue, // stop requested
                Err(e) => {
                    debug!("reconnect attempt failed: {}", e.display_with_inner());
                    continue; // the resolve backoff already waited
                }
            }
        }
        let Some(s) = stream.as_mut() else {
            core.reader_state.store(false, Ordering::Release);
            continue;
        };
        match s.read(&mut chunk) {
            Ok(0) => {
                info!("connection to {} gracefully closed by the server", core.address);
                set_last_error(FeedError::ConnectionGracefullyClosed);
                core.reader_state.store(false, Ordering::Release);
            }
            Ok(n) => {
                core.touch_last_received();
                if let Err(e) = crate::protocol::process_server_data(core, &chunk[..n]) {
                    error!("inbound stream fault: {}", e.display_with_inner());
                    set_last_error(e);
                    core.reader_state.store(false, Ordering::Release);
                }
            }
            Err(e) => {
                if !core.reader_stop.load(Ordering::Acquire) {
                    info!("socket read failed: {e}");
                    set_last_error(e.into());
                }
                core.reader_state.store(false, Ordering::Release);
            }
        }
    }
}

/// The task runner: heartbeat deadline, inbound-silence watchdog, and the
/// queue passes that emit every outbound frame.
fn queue_loop(core: &Arc<ConnectionCore>) {
    let period = core.config.heartbeat_period();
    let silence_limit = core.config.heartbeat_timeout();
    let mut next_heartbeat = Instant::now() + period;
    loop {
        if core.queue_stop.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        if now >= next_heartbeat {
            if core.socket_present() {
                if let Err(e) = send_heartbeat(core, true) {
                    debug!("heartbeat send failed: {}", e.display_with_inner());
                }
            }
            next_heartbeat = now + period;
        }
        if core.socket_present() && core.last_received_elapsed() > silence_limit {
            warn!(
                "no data from {} for over {silence_limit:?}; dropping the connection",
                core.address
            );
            core.close_socket();
            core.touch_last_received();
        }
        if !core.reader_state.load(Ordering::Acquire) || !core.queue_state.load(Ordering::Acquire)
        {
            std::thread::sleep(IDLE_TIMEOUT);
            continue;
        }
        if core.task_queue().is_empty() {
            std::thread::sleep(IDLE_TIMEOUT);
            continue;
        }
        if !core.task_queue().execute() {
            core.queue_state.store(false, Ordering::Release);
            continue;
        }
        std::thread::sleep(SMALL_TIMEOUT);
    }
}

// ---------------------------------------------------------------------------
// public handle
// ---------------------------------------------------------------------------

/// A connection to the feed.
///
/// Cloning yields another handle to the same connection. The connection
/// keeps running until [`Connection::close`] is called; dropping the last
/// handle without closing leaks the engine threads.
#[derive(Clone, Debug)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    pub(crate) fn core(&self) -> Arc<ConnectionCore> {
        Arc::clone(&self.core)
    }

    /// Dials `address` and brings up the engine threads; the protocol and
    /// record handshakes are on the wire before this returns control to
    /// the task runner.
    pub(crate) fn connect(
        runtime: Arc<RuntimeInner>,
        address: &str,
        config: FeedConfiguration,
    ) -> FeedResult<Self> {
        // surface grammar errors before any network work
        AddressList::parse(address)?;

        let storage_enabled = !config.disable_last_event_storage();
        let core = Arc::new(ConnectionCore {
            address: address.to_string(),
            config,
            runtime,
            socket: Mutex::new(None),
            resolved: Mutex::new(ResolvedAddresses::default()),
            task_queue: TaskQueue::new(),
            subscriptions: SubscriptionContext::new(storage_enabled),
            registry: Mutex::new(RecordRegistry::new()),
            protocol: Mutex::new(ProtocolState::new()),
            inbound: Mutex::new(InboundBuffer::new()),
            reader_state: AtomicBool::new(false),
            queue_state: AtomicBool::new(true),
            reader_stop: AtomicBool::new(false),
            queue_stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            threads: Mutex::new(ThreadHandles::default()),
            last_received: Mutex::new(Instant::now()),
            termination_notifier: Mutex::new(None),
        });

        core.resolve_address()?;
        let reader_stream = core.connect_to_resolved()?;

        // the task runner comes up first so it can serve the handshake
        {
            let queue_core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name("feed-task-runner".to_string())
                .spawn(move || queue_loop(&queue_core))?;
            let mut handles = core.threads.lock()?;
            handles.queue_id = Some(handle.thread().id());
            handles.queue = Some(handle);
        }
        {
            let reader_core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name("feed-reader".to_string())
                .spawn(move || reader_loop(&reader_core, Some(reader_stream)))?;
            let mut handles = core.threads.lock()?;
            handles.reader_id = Some(handle.thread().id());
            handles.reader = Some(handle);
        }

        send_protocol_description(&core, false)?;
        send_record_description(&core, false)?;

        Ok(Self { core })
    }

    /// The address collection this connection dials.
    pub fn address(&self) -> String {
        self.core.address.clone()
    }

    /// Creates a subscription for `event_types` with default flags.
    pub fn create_subscription(&self, event_types: EventTypes) -> FeedResult<Subscription> {
        self.create_subscription_with_flags(event_types, SubscriptionFlags::default(), 0)
    }

    /// Creates a subscription with explicit flags and, for time-series
    /// subscriptions, the history floor in epoch milliseconds.
    pub fn create_subscription_with_flags(
        &self,
        event_types: EventTypes,
        flags: SubscriptionFlags,
        time: i64,
    ) -> FeedResult<Subscription> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(FeedError::ConnectionClosed);
        }
        let id = self.core.subscriptions.create(event_types, flags, time)?;
        Ok(Subscription {
            connection: self.clone(),
            id,
        })
    }

    /// The last event of the given type seen for `symbol`.
    ///
    /// `event_types` must denote exactly one event type. Errors when the
    /// last-event cache is disabled by configuration.
    pub fn get_last_event(
        &self,
        symbol: &str,
        event_types: EventTypes,
    ) -> FeedResult<Option<EventData>> {
        let event: EventType = event_types
            .single()
            .ok_or(FeedError::InvalidEventType(event_types.0))?;
        self.core.subscriptions.last_event(symbol, event)
    }

    /// Whether the negotiated protocol supports `message`.
    pub fn is_message_supported(&self, message: MessageType) -> FeedResult<MessageSupport> {
        self.core.protocol.lock()?.message_support(message)
    }

    /// Sets a protocol property announced in `DESCRIBE_PROTOCOL`.
    /// Properties set after the handshake apply from the next reconnect.
    pub fn set_protocol_property(&self, key: &str, value: &str) -> FeedResult<()> {
        self.core.protocol.lock()?.set_property(key, value);
        Ok(())
    }

    /// The properties the server announced in its `DESCRIBE_PROTOCOL`.
    pub fn server_properties(&self) -> FeedResult<BTreeMap<String, String>> {
        Ok(self.core.protocol.lock()?.server_properties().clone())
    }

    /// Installs a callback invoked (on the reader thread) whenever the
    /// engine enters the reconnect branch.
    pub fn set_termination_notifier<F>(&self, notifier: F) -> FeedResult<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.core.termination_notifier.lock()? = Some(Box::new(notifier));
        Ok(())
    }

    /// Closes the connection and joins its threads.
    ///
    /// Called from a listener (i.e. from one of the connection's own
    /// threads), the close is deferred: it is queued on the runtime and
    /// performed by the next runtime call from an outside thread.
    pub fn close(&self) -> FeedResult<()> {
        if self.core.can_deinit() {
            self.core.shutdown();
        } else {
            debug!("close requested from an engine thread; deferring");
            self.core.runtime.defer_close(self.clone());
        }
        Ok(())
    }

    pub(crate) fn shutdown_now(&self) {
        self.core.shutdown();
    }
}
