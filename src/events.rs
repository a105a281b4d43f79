//! The typed market events delivered to listeners, the event-type bitmask,
//! per-event parameters, and the order-source model.

use std::fmt;

/// One market event kind. The discriminants index the per-symbol
/// last-event cache and the bits of [`EventTypes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Trade = 0,
    Quote = 1,
    Summary = 2,
    Profile = 3,
    Order = 4,
    TimeAndSale = 5,
}

pub(crate) const EVENT_TYPE_COUNT: usize = 6;

impl EventType {
    pub(crate) const ALL: [Self; EVENT_TYPE_COUNT] = [
        Self::Trade,
        Self::Quote,
        Self::Summary,
        Self::Profile,
        Self::Order,
        Self::TimeAndSale,
    ];

    /// The single-bit mask of this event type.
    pub fn mask(self) -> EventTypes {
        EventTypes(1 << (self as u32))
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// A set of event types, used wherever the C API took an event bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTypes(pub u32);

impl EventTypes {
    pub const TRADE: Self = Self(1 << 0);
    pub const QUOTE: Self = Self(1 << 1);
    pub const SUMMARY: Self = Self(1 << 2);
    pub const PROFILE: Self = Self(1 << 3);
    pub const ORDER: Self = Self(1 << 4);
    pub const TIME_AND_SALE: Self = Self(1 << 5);

    const KNOWN_MASK: u32 = (1 << EVENT_TYPE_COUNT as u32) - 1;

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, event: EventType) -> bool {
        self.0 & event.mask().0 != 0
    }

    /// True when the mask denotes at least one event and nothing unknown.
    pub(crate) fn is_valid(self) -> bool {
        self.0 != 0 && self.0 & !Self::KNOWN_MASK == 0
    }

    /// The single event type this mask denotes, if it denotes exactly one.
    pub(crate) fn single(self) -> Option<EventType> {
        EventType::ALL
            .into_iter()
            .find(|e| e.mask().0 == self.0)
    }

    pub(crate) fn iter(self) -> impl Iterator<Item = EventType> {
        EventType::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl std::ops::BitOr for EventTypes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for e in EventType::ALL {
            if self.contains(e) {
                set.entry(&e);
            }
        }
        set.finish()
    }
}

/// Last trade of an instrument.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trade {
    /// Milliseconds since the epoch.
    pub time: i64,
    pub sequence: i32,
    pub exchange_code: char,
    pub price: f64,
    pub size: f64,
    pub tick: i32,
    pub change: f64,
    pub day_volume: f64,
}

/// Best bid and offer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Quote {
    pub bid_time: i64,
    pub bid_exchange_code: char,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_time: i64,
    pub ask_exchange_code: char,
    pub ask_price: f64,
    pub ask_size: f64,
}

/// Daily summary values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Summary {
    pub day_open_price: f64,
    pub day_high_price: f64,
    pub day_low_price: f64,
    pub prev_day_close_price: f64,
    pub open_interest: i32,
}

/// Instrument profile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profile {
    pub beta: f64,
    pub eps: f64,
    pub high_limit_price: f64,
    pub low_limit_price: f64,
    pub description: String,
}

/// Side of an order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderSide {
    #[default]
    Undefined,
    Buy,
    Sell,
}

/// One level of a book, or one market-maker side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Order {
    pub index: i64,
    pub time: i64,
    pub sequence: i32,
    pub price: f64,
    pub size: f64,
    pub side: OrderSide,
    pub exchange_code: char,
    /// The source tag: a raw source for per-source book records, or one of
    /// the synthetic side tags for events derived from quotes and
    /// market-maker records.
    pub source: String,
    pub market_maker: String,
    pub event_flags: EventFlags,
}

/// One trade print with its sale conditions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeAndSale {
    pub time: i64,
    pub sequence: i32,
    pub exchange_code: char,
    pub price: f64,
    pub size: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub exchange_sale_conditions: String,
    pub event_flags: EventFlags,
}

/// A decoded event with its payload.
#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    Trade(Trade),
    Quote(Quote),
    Summary(Summary),
    Profile(Profile),
    Order(Order),
    TimeAndSale(TimeAndSale),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Trade(_) => EventType::Trade,
            Self::Quote(_) => EventType::Quote,
            Self::Summary(_) => EventType::Summary,
            Self::Profile(_) => EventType::Profile,
            Self::Order(_) => EventType::Order,
            Self::TimeAndSale(_) => EventType::TimeAndSale,
        }
    }
}

/// Per-event flags, as passed to V2 listeners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFlags(pub u32);

impl EventFlags {
    pub const TX_PENDING: Self = Self(0x01);
    pub const REMOVE_EVENT: Self = Self(0x02);
    pub const SNAPSHOT_BEGIN: Self = Self(0x04);
    pub const SNAPSHOT_END: Self = Self(0x08);
    pub const SNAPSHOT_SNIP: Self = Self(0x10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// The extra parameters V2 listeners receive with each event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventParams {
    pub flags: EventFlags,
    pub time_int_field: i64,
    pub snapshot_key: u64,
}

/// The published (raw) order sources seeded into every order subscription.
pub const PUBLISHED_ORDER_SOURCES: &[&str] = &[
    "NTV", "NFX", "ESPD", "XNFI", "ICE", "ISE", "DEA", "DEX", "BYX", "BZX", "BATE", "CHIX",
    "CEUX", "BXTR", "IST", "GLBX", "XEUR", "CFE", "C2OX", "SMFE", "MEMX",
];

/// The widest raw source tag that is transmitted on the wire.
pub(crate) const MAX_SOURCE_LEN: usize = 4;

/// The closed set of synthetic order sources. These are local filter tags
/// only and are never transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialSource {
    Default,
    CompositeBid,
    CompositeAsk,
    RegionalBid,
    RegionalAsk,
    AggregateBid,
    AggregateAsk,
    Empty,
    Composite,
    Regional,
    Aggregate,
}

impl SpecialSource {
    pub const ALL: [Self; 11] = [
        Self::Default,
        Self::CompositeBid,
        Self::CompositeAsk,
        Self::RegionalBid,
        Self::RegionalAsk,
        Self::AggregateBid,
        Self::AggregateAsk,
        Self::Empty,
        Self::Composite,
        Self::Regional,
        Self::Aggregate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::CompositeBid => "COMPOSITE_BID",
            Self::CompositeAsk => "COMPOSITE_ASK",
            Self::RegionalBid => "REGIONAL_BID",
            Self::RegionalAsk => "REGIONAL_ASK",
            Self::AggregateBid => "AGGREGATE_BID",
            Self::AggregateAsk => "AGGREGATE_ASK",
            Self::Empty => "EMPTY",
            Self::Composite => "COMPOSITE",
            Self::Regional => "REGIONAL",
            Self::Aggregate => "AGGREGATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    /// The group token a side tag belongs to; the groups map to themselves.
    pub fn group(self) -> Self {
        match self {
            Self::CompositeBid | Self::CompositeAsk | Self::Composite => Self::Composite,
            Self::RegionalBid | Self::RegionalAsk | Self::Regional => Self::Regional,
            Self::AggregateBid | Self::AggregateAsk | Self::Aggregate => Self::Aggregate,
            other => other,
        }
    }
}
