//! The per-connection subscription manager: the symbol table, subscription
//! objects, listener lists, order-source filtering, and the last-event
//! cache.
//!
//! Symbols and subscriptions live in two arenas owned by the connection
//! and reference each other by index; a symbol's refcount is the number of
//! subscriptions holding it, and it leaves the table exactly when the
//! refcount reaches zero.

use crate::conn::Connection;
use crate::events::{
    EventData, EventParams, EventType, EventTypes, SpecialSource, EVENT_TYPE_COUNT,
    MAX_SOURCE_LEN, PUBLISHED_ORDER_SOURCES,
};
use crate::protocol::{subscribe_symbols, SubscribeRequest};
use crate::{FeedError, FeedResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

pub(crate) type SymbolId = usize;
pub(crate) type SubscriptionId = usize;

/// Identifies one registered listener of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(usize);

/// Behavioural flags of a subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFlags(pub u32);

impl SubscriptionFlags {
    /// Deliver through the ticker channel even for stream-natured events.
    pub const SINGLE_RECORD: Self = Self(0x01);
    /// Route through the history channel with the subscription time floor.
    pub const TIME_SERIES: Self = Self(0x02);
    /// Extend quote delivery with regional quote records.
    pub const REGIONAL_QUOTES: Self = Self(0x04);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SubscriptionFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

pub(crate) enum ListenerKind {
    Default(Box<dyn Fn(&str, &EventData) + Send>),
    V2(Box<dyn Fn(&str, &EventData, &EventParams) + Send>),
}

impl std::fmt::Debug for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default(_) => f.write_str("ListenerKind::Default"),
            Self::V2(_) => f.write_str("ListenerKind::V2"),
        }
    }
}

#[derive(Debug)]
struct SymbolData {
    name: String,
    ref_count: usize,
    subscriptions: Vec<SubscriptionId>,
    last_events: Option<Box<[Option<EventData>; EVENT_TYPE_COUNT]>>,
}

#[derive(Debug)]
struct SubscriptionData {
    event_types: EventTypes,
    flags: SubscriptionFlags,
    time: i64,
    symbols: Vec<SymbolId>,
    listeners: Vec<(ListenerId, ListenerKind)>,
    next_listener: usize,
    /// Accepted order sources, raw tags and special tokens alike.
    order_sources: BTreeSet<String>,
}

/// Everything a (re-)subscribe operation needs to compose wire frames.
#[derive(Clone, Debug)]
pub(crate) struct SubscriptionSnapshot {
    pub event_types: EventTypes,
    pub flags: SubscriptionFlags,
    pub time: i64,
    pub symbols: Vec<String>,
    pub raw_sources: Vec<String>,
    pub groups: Vec<SpecialSource>,
}

#[derive(Debug, Default)]
struct SubscrInner {
    symbol_table: HashMap<String, SymbolId>,
    symbols: Vec<Option<SymbolData>>,
    free_symbols: Vec<SymbolId>,
    subscriptions: Vec<Option<SubscriptionData>>,
    free_subscriptions: Vec<SubscriptionId>,
}

/// The subscription state of one connection, behind its own mutex.
///
/// Dispatch holds the mutex across listener callbacks; listeners must not
/// call back into the same connection's subscription API.
#[derive(Debug)]
pub(crate) struct SubscriptionContext {
    inner: Mutex<SubscrInner>,
    storage_enabled: bool,
}

impl SubscrInner {
    fn subscription(&mut self, id: SubscriptionId) -> FeedResult<&mut SubscriptionData> {
        self.subscriptions
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(FeedError::InvalidSubscription)
    }

    fn intern_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbol_table.get(name) {
            return id;
        }
        let data = SymbolData {
            name: name.to_string(),
            ref_count: 0,
            subscriptions: Vec::new(),
            last_events: None,
        };
        let id = if let Some(id) = self.free_symbols.pop() {
            self.symbols[id] = Some(data);
            id
        } else {
            self.symbols.push(Some(data));
            self.symbols.len() - 1
        };
        self.symbol_table.insert(name.to_string(), id);
        id
    }

    /// Drops one reference; removes the symbol (and its last-event cache)
    /// when the count reaches zero.
    fn release_symbol(&mut self, id: SymbolId) {
        let remove = {
            let Some(sym) = self.symbols[id].as_mut() else {
                return;
            };
            sym.ref_count -= 1;
            sym.ref_count == 0
        };
        if remove {
            if let Some(sym) = self.symbols[id].take() {
                self.symbol_table.remove(&sym.name);
            }
            self.free_symbols.push(id);
        }
    }
}

impl SubscriptionContext {
    pub fn new(storage_enabled: bool) -> Self {
        Self {
            inner: Mutex::new(SubscrInner::default()),
            storage_enabled,
        }
    }

    pub fn create(
        &self,
        event_types: EventTypes,
        flags: SubscriptionFlags,
        time: i64,
    ) -> FeedResult<SubscriptionId> {
        if !event_types.is_valid() {
            return Err(FeedError::InvalidEventType(event_types.0));
        }
        let mut order_sources = BTreeSet::new();
        if event_types.contains(EventType::Order) {
            for s in PUBLISHED_ORDER_SOURCES {
                order_sources.insert((*s).to_string());
            }
            for s in [
                SpecialSource::Aggregate,
                SpecialSource::Regional,
                SpecialSource::Composite,
            ] {
                order_sources.insert(s.as_str().to_string());
            }
        }
        let data = SubscriptionData {
            event_types,
            flags,
            time,
            symbols: Vec::new(),
            listeners: Vec::new(),
            next_listener: 0,
            order_sources,
        };
        let mut inner = self.inner.lock()?;
        let id = if let Some(id) = inner.free_subscriptions.pop() {
            inner.subscriptions[id] = Some(data);
            id
        } else {
            inner.subscriptions.push(Some(data));
            inner.subscriptions.len() - 1
        };
        Ok(id)
    }

    /// Links `symbols` into the subscription; returns the symbols that
    /// were not attached to it before.
    pub fn add_symbols(&self, id: SubscriptionId, symbols: &[&str]) -> FeedResult<Vec<String>> {
        let mut inner = self.inner.lock()?;
        let mut added = Vec::new();
        for &name in symbols {
            if name.is_empty() {
                return Err(FeedError::InvalidSymbolName);
            }
            let sym_id = inner.intern_symbol(name);
            let sub = inner.subscription(id)?;
            if sub.symbols.contains(&sym_id) {
                continue;
            }
            sub.symbols.push(sym_id);
            let sym = inner.symbols[sym_id]
                .as_mut()
                .expect("symbol just interned");
            sym.subscriptions.push(id);
            sym.ref_count += 1;
            added.push(name.to_string());
        }
        Ok(added)
    }

    /// Unlinks `symbols`; returns the symbols that actually were attached.
    pub fn remove_symbols(&self, id: SubscriptionId, symbols: &[&str]) -> FeedResult<Vec<String>> {
        let mut inner = self.inner.lock()?;
        let mut removed = Vec::new();
        for &name in symbols {
            let Some(&sym_id) = inner.symbol_table.get(name) else {
                continue;
            };
            let sub = inner.subscription(id)?;
            let Some(pos) = sub.symbols.iter().position(|&s| s == sym_id) else {
                continue;
            };
            sub.symbols.swap_remove(pos);
            if let Some(sym) = inner.symbols[sym_id].as_mut() {
                sym.subscriptions.retain(|&s| s != id);
            }
            inner.release_symbol(sym_id);
            removed.push(name.to_string());
        }
        Ok(removed)
    }

    /// Unlinks everything and removes the subscription from the registry;
    /// returns its final snapshot for the unsubscribe frames.
    pub fn close(&self, id: SubscriptionId) -> FeedResult<SubscriptionSnapshot> {
        let mut inner = self.inner.lock()?;
        let snapshot = Self::snapshot_locked(&inner, id)?;
        let Some(sub) = inner.subscriptions[id].take() else {
            return Err(FeedError::InvalidSubscription);
        };
        for sym_id in sub.symbols {
            if let Some(sym) = inner.symbols[sym_id].as_mut() {
                sym.subscriptions.retain(|&s| s != id);
            }
            inner.release_symbol(sym_id);
        }
        inner.free_subscriptions.push(id);
        Ok(snapshot)
    }

    pub fn add_listener(&self, id: SubscriptionId, listener: ListenerKind) -> FeedResult<ListenerId> {
        let mut inner = self.inner.lock()?;
        let sub = inner.subscription(id)?;
        let lid = ListenerId(sub.next_listener);
        sub.next_listener += 1;
        sub.listeners.push((lid, listener));
        Ok(lid)
    }

    pub fn remove_listener(&self, id: SubscriptionId, listener: ListenerId) -> FeedResult<()> {
        let mut inner = self.inner.lock()?;
        let sub = inner.subscription(id)?;
        let before = sub.listeners.len();
        sub.listeners.retain(|(lid, _)| *lid != listener);
        if sub.listeners.len() == before {
            return Err(FeedError::InvalidListener);
        }
        Ok(())
    }

    pub fn add_order_source(&self, id: SubscriptionId, source: &str) -> FeedResult<()> {
        if SpecialSource::parse(source).is_none()
            && (source.is_empty() || source.len() > MAX_SOURCE_LEN)
        {
            return Err(FeedError::InvalidFunctionArg(format!(
                "order source {source:?} exceeds the wire suffix width"
            )));
        }
        let mut inner = self.inner.lock()?;
        let sub = inner.subscription(id)?;
        sub.order_sources.insert(source.to_string());
        Ok(())
    }

    pub fn clear_order_sources(&self, id: SubscriptionId) -> FeedResult<()> {
        let mut inner = self.inner.lock()?;
        let sub = inner.subscription(id)?;
        sub.order_sources.clear();
        Ok(())
    }

    fn snapshot_locked(inner: &SubscrInner, id: SubscriptionId) -> FeedResult<SubscriptionSnapshot> {
        let sub = inner
            .subscriptions
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(FeedError::InvalidSubscription)?;
        let symbols = sub
            .symbols
            .iter()
            .filter_map(|&s| inner.symbols[s].as_ref().map(|d| d.name.clone()))
            .collect();
        let mut raw_sources = Vec::new();
        let mut groups = Vec::new();
        for source in &sub.order_sources {
            match SpecialSource::parse(source) {
                Some(special) => {
                    let group = special.group();
                    if matches!(
                        group,
                        SpecialSource::Composite | SpecialSource::Regional | SpecialSource::Aggregate
                    ) && !groups.contains(&group)
                    {
                        groups.push(group);
                    }
                }
                None => raw_sources.push(source.clone()),
            }
        }
        Ok(SubscriptionSnapshot {
            event_types: sub.event_types,
            flags: sub.flags,
            time: sub.time,
            symbols,
            raw_sources,
            groups,
        })
    }

    pub fn snapshot(&self, id: SubscriptionId) -> FeedResult<SubscriptionSnapshot> {
        let inner = self.inner.lock()?;
        Self::snapshot_locked(&inner, id)
    }

    /// Snapshots of every live subscription; the reconnect refresher
    /// replays these against the new session.
    pub fn all_snapshots(&self) -> FeedResult<Vec<SubscriptionSnapshot>> {
        let inner = self.inner.lock()?;
        let mut out = Vec::new();
        for id in 0..inner.subscriptions.len() {
            if inner.subscriptions[id].is_some() {
                out.push(Self::snapshot_locked(&inner, id)?);
            }
        }
        Ok(out)
    }

    /// Fans one decoded event out to the listeners of every matching
    /// subscription of `symbol`, and of the wildcard symbol if present.
    pub fn dispatch(&self, symbol: &str, data: &EventData, params: &EventParams) -> FeedResult<()> {
        let mut inner = self.inner.lock()?;
        self.dispatch_to(&mut inner, symbol, symbol, data, params)?;
        if symbol != "*" && inner.symbol_table.contains_key("*") {
            self.dispatch_to(&mut inner, "*", symbol, data, params)?;
        }
        Ok(())
    }

    fn dispatch_to(
        &self,
        inner: &mut SubscrInner,
        table_symbol: &str,
        event_symbol: &str,
        data: &EventData,
        params: &EventParams,
    ) -> FeedResult<()> {
        let Some(&sym_id) = inner.symbol_table.get(table_symbol) else {
            // data raced an unsubscribe; nothing to do
            return Ok(());
        };
        let event_type = data.event_type();
        if self.storage_enabled {
            if let Some(sym) = inner.symbols[sym_id].as_mut() {
                let slots = sym
                    .last_events
                    .get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
                slots[event_type.index()] = Some(data.clone());
            }
        }
        let subscriptions = match inner.symbols[sym_id].as_ref() {
            Some(sym) => sym.subscriptions.clone(),
            None => return Ok(()),
        };
        for sub_id in subscriptions {
            let Some(sub) = inner.subscriptions.get(sub_id).and_then(Option::as_ref) else {
                continue;
            };
            if !sub.event_types.contains(event_type) {
                continue;
            }
            if let EventData::Order(order) = data {
                if !sub.order_sources.is_empty() && !Self::source_accepted(sub, &order.source) {
                    continue;
                }
            }
            for (_, listener) in &sub.listeners {
                match listener {
                    ListenerKind::Default(f) => f(event_symbol, data),
                    ListenerKind::V2(f) => f(event_symbol, data, params),
                }
            }
        }
        Ok(())
    }

    /// Raw sources match by exact tag; a synthetic side tag also matches a
    /// subscription that accepted its group token.
    fn source_accepted(sub: &SubscriptionData, source: &str) -> bool {
        if sub.order_sources.contains(source) {
            return true;
        }
        match SpecialSource::parse(source) {
            Some(special) => {
                let group = special.group();
                group != special && sub.order_sources.contains(group.as_str())
            }
            None => false,
        }
    }

    /// The last event of `event_type` seen for `symbol`.
    pub fn last_event(&self, symbol: &str, event_type: EventType) -> FeedResult<Option<EventData>> {
        if !self.storage_enabled {
            return Err(FeedError::Usage(
                "last-event storage is disabled by configuration",
            ));
        }
        let inner = self.inner.lock()?;
        let Some(&sym_id) = inner.symbol_table.get(symbol) else {
            return Ok(None);
        };
        Ok(inner.symbols[sym_id]
            .as_ref()
            .and_then(|s| s.last_events.as_ref())
            .and_then(|slots| slots[event_type.index()].clone()))
    }

    /// Refcount invariant check hook for tests: every symbol in the table
    /// is held by exactly `ref_count` live subscriptions.
    #[cfg(test)]
    fn assert_refcounts(&self) {
        let inner = self.inner.lock().unwrap();
        for sym in inner.symbols.iter().flatten() {
            assert!(sym.ref_count > 0);
            assert_eq!(sym.ref_count, sym.subscriptions.len());
            for &sub_id in &sym.subscriptions {
                assert!(inner.subscriptions[sub_id].is_some());
            }
        }
    }
}

/// A subscription handle. Symbols, listeners and order sources are managed
/// through it; dropping the handle leaves the subscription active on the
/// connection until [`Subscription::close`] is called.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) connection: Connection,
    pub(crate) id: SubscriptionId,
}

impl Subscription {
    /// Subscribes the symbols and announces them to the server.
    pub fn add_symbols(&self, symbols: &[&str]) -> FeedResult<()> {
        let core = self.connection.core();
        let added = core.subscriptions().add_symbols(self.id, symbols)?;
        if added.is_empty() {
            return Ok(());
        }
        let snapshot = core.subscriptions().snapshot(self.id)?;
        let request = SubscribeRequest::from_snapshot(&snapshot, added, false);
        subscribe_symbols(&core, request, false)
    }

    /// Removes the symbols and revokes them on the server.
    pub fn remove_symbols(&self, symbols: &[&str]) -> FeedResult<()> {
        let core = self.connection.core();
        let removed = core.subscriptions().remove_symbols(self.id, symbols)?;
        if removed.is_empty() {
            return Ok(());
        }
        let snapshot = core.subscriptions().snapshot(self.id)?;
        let request = SubscribeRequest::from_snapshot(&snapshot, removed, true);
        subscribe_symbols(&core, request, false)
    }

    /// Registers a data-only listener.
    pub fn add_listener<F>(&self, listener: F) -> FeedResult<ListenerId>
    where
        F: Fn(&str, &EventData) + Send + 'static,
    {
        self.connection
            .core()
            .subscriptions()
            .add_listener(self.id, ListenerKind::Default(Box::new(listener)))
    }

    /// Registers a listener that additionally receives per-event
    /// parameters (flags, time field, snapshot key).
    pub fn add_listener_v2<F>(&self, listener: F) -> FeedResult<ListenerId>
    where
        F: Fn(&str, &EventData, &EventParams) + Send + 'static,
    {
        self.connection
            .core()
            .subscriptions()
            .add_listener(self.id, ListenerKind::V2(Box::new(listener)))
    }

    pub fn remove_listener(&self, listener: ListenerId) -> FeedResult<()> {
        self.connection
            .core()
            .subscriptions()
            .remove_listener(self.id, listener)
    }

    /// Accepts an additional order source, raw (`"NTV"`) or special
    /// (`"COMPOSITE"`). Affects filtering immediately and the record set
    /// of subsequent subscribe operations.
    pub fn add_order_source(&self, source: &str) -> FeedResult<()> {
        self.connection
            .core()
            .subscriptions()
            .add_order_source(self.id, source)
    }

    /// Drops all accepted order sources.
    pub fn clear_order_sources(&self) -> FeedResult<()> {
        self.connection
            .core()
            .subscriptions()
            .clear_order_sources(self.id)
    }

    /// Unsubscribes every symbol, revokes them on the server, and removes
    /// the subscription from the connection.
    pub fn close(self) -> FeedResult<()> {
        let core = self.connection.core();
        let snapshot = core.subscriptions().close(self.id)?;
        if snapshot.symbols.is_empty() {
            return Ok(());
        }
        let symbols = snapshot.symbols.clone();
        let request = SubscribeRequest::from_snapshot(&snapshot, symbols, true);
        subscribe_symbols(&core, request, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Trade;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn trade_event() -> EventData {
        EventData::Trade(Trade {
            price: 10.0,
            ..Trade::default()
        })
    }

    #[test]
    fn refcount_tracks_owning_subscriptions() {
        let ctx = SubscriptionContext::new(false);
        let a = ctx.create(EventTypes::TRADE, SubscriptionFlags::default(), 0).unwrap();
        let b = ctx.create(EventTypes::TRADE, SubscriptionFlags::default(), 0).unwrap();
        assert_eq!(ctx.add_symbols(a, &["IBM", "MSFT"]).unwrap().len(), 2);
        assert_eq!(ctx.add_symbols(b, &["IBM"]).unwrap(), vec!["IBM"]);
        // re-adding is a no-op
        assert!(ctx.add_symbols(a, &["IBM"]).unwrap().is_empty());
        ctx.assert_refcounts();

        assert_eq!(ctx.remove_symbols(a, &["IBM"]).unwrap(), vec!["IBM"]);
        ctx.assert_refcounts();
        // IBM still interned for b
        ctx.dispatch("IBM", &trade_event(), &EventParams::default()).unwrap();

        assert_eq!(ctx.remove_symbols(b, &["IBM"]).unwrap(), vec!["IBM"]);
        let inner = ctx.inner.lock().unwrap();
        assert!(!inner.symbol_table.contains_key("IBM"));
        assert!(inner.symbol_table.contains_key("MSFT"));
    }

    #[test]
    fn listeners_fire_once_per_matching_dispatch() {
        let ctx = SubscriptionContext::new(false);
        let sub = ctx
            .create(EventTypes::TRADE, SubscriptionFlags::default(), 0)
            .unwrap();
        ctx.add_symbols(sub, &["IBM"]).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        ctx.add_listener(
            sub,
            ListenerKind::Default(Box::new(move |symbol, _| {
                assert_eq!(symbol, "IBM");
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        ctx.dispatch("IBM", &trade_event(), &EventParams::default()).unwrap();
        // wrong event type: no call
        ctx.dispatch(
            "IBM",
            &EventData::Quote(crate::events::Quote::default()),
            &EventParams::default(),
        )
        .unwrap();
        // unknown symbol: no call
        ctx.dispatch("AAPL", &trade_event(), &EventParams::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_versions_receive_their_own_contract() {
        let ctx = SubscriptionContext::new(false);
        let sub = ctx
            .create(EventTypes::TRADE, SubscriptionFlags::default(), 0)
            .unwrap();
        ctx.add_symbols(sub, &["IBM"]).unwrap();
        let v1 = Arc::new(AtomicUsize::new(0));
        let v2 = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&v1);
        let c2 = Arc::clone(&v2);
        ctx.add_listener(sub, ListenerKind::Default(Box::new(move |_, _| {
            c1.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        let lid = ctx
            .add_listener(
                sub,
                ListenerKind::V2(Box::new(move |_, _, params| {
                    assert_eq!(params.time_int_field, 7);
                    c2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        let params = EventParams {
            time_int_field: 7,
            ..EventParams::default()
        };
        ctx.dispatch("IBM", &trade_event(), &params).unwrap();
        assert_eq!(v1.load(Ordering::SeqCst), 1);
        assert_eq!(v2.load(Ordering::SeqCst), 1);

        ctx.remove_listener(sub, lid).unwrap();
        ctx.dispatch("IBM", &trade_event(), &params).unwrap();
        assert_eq!(v2.load(Ordering::SeqCst), 1);
        assert!(matches!(
            ctx.remove_listener(sub, lid),
            Err(FeedError::InvalidListener)
        ));
    }

    #[test]
    fn order_sources_filter_with_group_synonyms() {
        let ctx = SubscriptionContext::new(false);
        let sub = ctx
            .create(EventTypes::ORDER, SubscriptionFlags::default(), 0)
            .unwrap();
        ctx.add_symbols(sub, &["IBM"]).unwrap();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.add_listener(
            sub,
            ListenerKind::Default(Box::new(move |_, data| {
                if let EventData::Order(o) = data {
                    sink.lock().unwrap().push(o.source.clone());
                }
            })),
        )
        .unwrap();

        let dispatch_source = |source: &str| {
            let order = crate::events::Order {
                source: source.to_string(),
                ..crate::events::Order::default()
            };
            ctx.dispatch("IBM", &EventData::Order(order), &EventParams::default())
                .unwrap();
        };

        // seeded sources: NTV raw, COMPOSITE group accepting its sides
        dispatch_source("NTV");
        dispatch_source("COMPOSITE_ASK");
        dispatch_source("AGGREGATE_BID");
        dispatch_source("XXXX"); // unknown raw: filtered

        // narrow to a single raw source
        ctx.clear_order_sources(sub).unwrap();
        ctx.add_order_source(sub, "NTV").unwrap();
        dispatch_source("NTV");
        dispatch_source("COMPOSITE_ASK"); // no COMPOSITE acceptance anymore

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["NTV", "COMPOSITE_ASK", "AGGREGATE_BID", "NTV"]
        );
    }

    #[test]
    fn oversized_raw_source_is_rejected() {
        let ctx = SubscriptionContext::new(false);
        let sub = ctx
            .create(EventTypes::ORDER, SubscriptionFlags::default(), 0)
            .unwrap();
        assert!(ctx.add_order_source(sub, "TOOLONG").is_err());
        assert!(ctx.add_order_source(sub, "COMPOSITE_BID").is_ok());
    }

    #[test]
    fn wildcard_symbol_receives_everything() {
        let ctx = SubscriptionContext::new(false);
        let sub = ctx
            .create(EventTypes::TRADE, SubscriptionFlags::default(), 0)
            .unwrap();
        ctx.add_symbols(sub, &["*"]).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        ctx.add_listener(
            sub,
            ListenerKind::Default(Box::new(move |symbol, _| {
                assert_eq!(symbol, "AAPL");
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        ctx.dispatch("AAPL", &trade_event(), &EventParams::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_event_cache_respects_configuration() {
        let disabled = SubscriptionContext::new(false);
        assert!(disabled.last_event("IBM", EventType::Trade).is_err());

        let ctx = SubscriptionContext::new(true);
        let sub = ctx
            .create(EventTypes::TRADE, SubscriptionFlags::default(), 0)
            .unwrap();
        ctx.add_symbols(sub, &["IBM"]).unwrap();
        assert_eq!(ctx.last_event("IBM", EventType::Trade).unwrap(), None);
        ctx.dispatch("IBM", &trade_event(), &EventParams::default()).unwrap();
        match ctx.last_event("IBM", EventType::Trade).unwrap() {
            Some(EventData::Trade(t)) => assert!((t.price - 10.0).abs() < f64::EPSILON),
            other => panic!("unexpected cache content: {other:?}"),
        }
        // removing the last holder frees the cache entry
        ctx.remove_symbols(sub, &["IBM"]).unwrap();
        assert_eq!(ctx.last_event("IBM", EventType::Trade).unwrap(), None);
    }

    #[test]
    fn close_returns_the_final_snapshot() {
        let ctx = SubscriptionContext::new(false);
        let sub = ctx
            .create(
                EventTypes::ORDER | EventTypes::TRADE,
                SubscriptionFlags::TIME_SERIES,
                42,
            )
            .unwrap();
        ctx.add_symbols(sub, &["IBM", "MSFT"]).unwrap();
        let snapshot = ctx.close(sub).unwrap();
        assert_eq!(snapshot.symbols.len(), 2);
        assert_eq!(snapshot.time, 42);
        assert!(snapshot.groups.contains(&SpecialSource::Composite));
        assert!(snapshot.raw_sources.contains(&"NTV".to_string()));
        assert!(matches!(
            ctx.snapshot(sub),
            Err(FeedError::InvalidSubscription)
        ));
        let inner = ctx.inner.lock().unwrap();
        assert!(inner.symbol_table.is_empty());
    }
}
