//! The client-side record schemas: ordered field lists with wire types,
//! setters and default-value getters, plus the transcoder that turns
//! decoded records into public events.

use crate::events::{
    EventData, EventFlags, EventParams, Order, OrderSide, Profile, Quote, SpecialSource, Summary,
    TimeAndSale, Trade,
};
use crate::protocol::FieldType;

/// Index into the connection's local record roster.
pub(crate) type RecordId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Trade,
    Quote,
    Summary,
    Profile,
    MarketMaker,
    TimeAndSale,
    Order,
}

/// A value decoded from one record field, as handed to setters and
/// produced by default getters.
#[derive(Clone, Debug)]
pub(crate) enum FieldValue {
    Int(i32),
    Double(f64),
    Char(char),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
}

impl FieldValue {
    fn into_f64(self) -> f64 {
        match self {
            Self::Double(d) => d,
            Self::Int(i) => f64::from(i),
            _ => f64::NAN,
        }
    }

    fn into_i32(self) -> i32 {
        match self {
            Self::Int(i) => i,
            #[allow(clippy::cast_possible_truncation)]
            Self::Double(d) => d as i32,
            _ => 0,
        }
    }

    /// Wire times are seconds; events carry milliseconds.
    fn into_time_millis(self) -> i64 {
        i64::from(self.into_i32()) * 1000
    }

    fn into_char(self) -> char {
        match self {
            Self::Char(c) => c,
            _ => '\0',
        }
    }

    fn into_text(self) -> String {
        match self {
            Self::Text(Some(s)) => s,
            _ => String::new(),
        }
    }

    #[allow(clippy::cast_sign_loss)]
    fn into_flags(self) -> EventFlags {
        EventFlags(self.into_i32() as u32)
    }

    fn into_side(self) -> OrderSide {
        match self.into_i32() {
            1 => OrderSide::Buy,
            2 => OrderSide::Sell,
            _ => OrderSide::Undefined,
        }
    }
}

/// Market-maker record payload; it has no public event of its own and
/// transcodes into a pair of aggregate-book orders.
#[derive(Clone, Debug, Default)]
pub(crate) struct MarketMakerRecord {
    pub exchange: char,
    pub id: String,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
}

/// Per-source order-book record payload.
#[derive(Clone, Debug, Default)]
pub(crate) struct OrderRecord {
    pub index: i32,
    pub time: i64,
    pub sequence: i32,
    pub price: f64,
    pub size: f64,
    pub side: OrderSide,
    pub exchange_code: char,
    pub market_maker: String,
    pub event_flags: EventFlags,
}

/// A record buffer under decoding; field setters write into it.
#[derive(Clone, Debug)]
pub(crate) enum RecordData {
    Trade(Trade),
    Quote(Quote),
    Summary(Summary),
    Profile(Profile),
    MarketMaker(MarketMakerRecord),
    TimeAndSale(TimeAndSale),
    Order(OrderRecord),
}

impl RecordKind {
    pub(crate) fn new_data(self) -> RecordData {
        match self {
            Self::Trade => RecordData::Trade(Trade::default()),
            Self::Quote => RecordData::Quote(Quote::default()),
            Self::Summary => RecordData::Summary(Summary::default()),
            Self::Profile => RecordData::Profile(Profile::default()),
            Self::MarketMaker => RecordData::MarketMaker(MarketMakerRecord::default()),
            Self::TimeAndSale => RecordData::TimeAndSale(TimeAndSale::default()),
            Self::Order => RecordData::Order(OrderRecord::default()),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct FieldInfo {
    pub name: &'static str,
    pub field_type: FieldType,
    pub set: fn(&mut RecordData, FieldValue),
    pub default: fn() -> FieldValue,
}

impl std::fmt::Debug for FieldInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldInfo")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .finish()
    }
}

/// One local record: its wire name, kind and ordered field list.
#[derive(Clone, Debug)]
pub(crate) struct RecordInfo {
    pub name: String,
    pub kind: RecordKind,
    pub fields: &'static [FieldInfo],
}

fn default_nan() -> FieldValue {
    FieldValue::Double(f64::NAN)
}
fn default_zero() -> FieldValue {
    FieldValue::Int(0)
}
fn default_char() -> FieldValue {
    FieldValue::Char('\0')
}
fn default_text() -> FieldValue {
    FieldValue::Text(None)
}

macro_rules! setter {
    ($name:ident, $variant:ident, $field:ident, $conv:ident) => {
        fn $name(r: &mut RecordData, v: FieldValue) {
            if let RecordData::$variant(d) = r {
                d.$field = v.$conv();
            }
        }
    };
}

setter!(trade_time, Trade, time, into_time_millis);
setter!(trade_sequence, Trade, sequence, into_i32);
setter!(trade_exchange, Trade, exchange_code, into_char);
setter!(trade_price, Trade, price, into_f64);
setter!(trade_size, Trade, size, into_f64);
setter!(trade_tick, Trade, tick, into_i32);
setter!(trade_change, Trade, change, into_f64);
setter!(trade_day_volume, Trade, day_volume, into_f64);

setter!(quote_bid_time, Quote, bid_time, into_time_millis);
setter!(quote_bid_exchange, Quote, bid_exchange_code, into_char);
setter!(quote_bid_price, Quote, bid_price, into_f64);
setter!(quote_bid_size, Quote, bid_size, into_f64);
setter!(quote_ask_time, Quote, ask_time, into_time_millis);
setter!(quote_ask_exchange, Quote, ask_exchange_code, into_char);
setter!(quote_ask_price, Quote, ask_price, into_f64);
setter!(quote_ask_size, Quote, ask_size, into_f64);

setter!(summary_day_open, Summary, day_open_price, into_f64);
setter!(summary_day_high, Summary, day_high_price, into_f64);
setter!(summary_day_low, Summary, day_low_price, into_f64);
setter!(summary_prev_close, Summary, prev_day_close_price, into_f64);
setter!(summary_open_interest, Summary, open_interest, into_i32);

setter!(profile_beta, Profile, beta, into_f64);
setter!(profile_eps, Profile, eps, into_f64);
setter!(profile_high_limit, Profile, high_limit_price, into_f64);
setter!(profile_low_limit, Profile, low_limit_price, into_f64);
setter!(profile_description, Profile, description, into_text);

setter!(mm_exchange, MarketMaker, exchange, into_char);
setter!(mm_id, MarketMaker, id, into_text);
setter!(mm_bid_price, MarketMaker, bid_price, into_f64);
setter!(mm_bid_size, MarketMaker, bid_size, into_f64);
setter!(mm_ask_price, MarketMaker, ask_price, into_f64);
setter!(mm_ask_size, MarketMaker, ask_size, into_f64);

setter!(tns_time, TimeAndSale, time, into_time_millis);
setter!(tns_sequence, TimeAndSale, sequence, into_i32);
setter!(tns_exchange, TimeAndSale, exchange_code, into_char);
setter!(tns_price, TimeAndSale, price, into_f64);
setter!(tns_size, TimeAndSale, size, into_f64);
setter!(tns_bid_price, TimeAndSale, bid_price, into_f64);
setter!(tns_ask_price, TimeAndSale, ask_price, into_f64);
setter!(tns_conditions, TimeAndSale, exchange_sale_conditions, into_text);
setter!(tns_flags, TimeAndSale, event_flags, into_flags);

setter!(order_index, Order, index, into_i32);
setter!(order_time, Order, time, into_time_millis);
setter!(order_sequence, Order, sequence, into_i32);
setter!(order_price, Order, price, into_f64);
setter!(order_size, Order, size, into_f64);
setter!(order_side, Order, side, into_side);
setter!(order_exchange, Order, exchange_code, into_char);
setter!(order_market_maker, Order, market_maker, into_text);
setter!(order_flags, Order, event_flags, into_flags);

const COMPACT: FieldType = FieldType(0x05);
const COMPACT_DECIMAL: FieldType = FieldType(0x15);
const UTF_CHAR: FieldType = FieldType(0x02);
const STRING: FieldType = FieldType(0x86);
const CHAR_ARRAY: FieldType = FieldType(0x07);

macro_rules! field {
    ($name:literal, $ft:expr, $set:ident, $default:ident) => {
        FieldInfo {
            name: $name,
            field_type: $ft,
            set: $set,
            default: $default,
        }
    };
}

const TRADE_FIELDS: &[FieldInfo] = &[
    field!("Time", COMPACT, trade_time, default_zero),
    field!("Sequence", COMPACT, trade_sequence, default_zero),
    field!("ExchangeCode", UTF_CHAR, trade_exchange, default_char),
    field!("Price", COMPACT_DECIMAL, trade_price, default_nan),
    field!("Size", COMPACT_DECIMAL, trade_size, default_nan),
    field!("Tick", COMPACT, trade_tick, default_zero),
    field!("Change", COMPACT_DECIMAL, trade_change, default_nan),
    field!("DayVolume", COMPACT_DECIMAL, trade_day_volume, default_nan),
];

const QUOTE_FIELDS: &[FieldInfo] = &[
    field!("BidTime", COMPACT, quote_bid_time, default_zero),
    field!("BidExchangeCode", UTF_CHAR, quote_bid_exchange, default_char),
    field!("BidPrice", COMPACT_DECIMAL, quote_bid_price, default_nan),
    field!("BidSize", COMPACT_DECIMAL, quote_bid_size, default_nan),
    field!("AskTime", COMPACT, quote_ask_time, default_zero),
    field!("AskExchangeCode", UTF_CHAR, quote_ask_exchange, default_char),
    field!("AskPrice", COMPACT_DECIMAL, quote_ask_price, default_nan),
    field!("AskSize", COMPACT_DECIMAL, quote_ask_size, default_nan),
];

const SUMMARY_FIELDS: &[FieldInfo] = &[
    field!("DayOpenPrice", COMPACT_DECIMAL, summary_day_open, default_nan),
    field!("DayHighPrice", COMPACT_DECIMAL, summary_day_high, default_nan),
    field!("DayLowPrice", COMPACT_DECIMAL, summary_day_low, default_nan),
    field!("PrevDayClosePrice", COMPACT_DECIMAL, summary_prev_close, default_nan),
    field!("OpenInterest", COMPACT, summary_open_interest, default_zero),
];

const PROFILE_FIELDS: &[FieldInfo] = &[
    field!("Beta", COMPACT_DECIMAL, profile_beta, default_nan),
    field!("Eps", COMPACT_DECIMAL, profile_eps, default_nan),
    field!("HighLimitPrice", COMPACT_DECIMAL, profile_high_limit, default_nan),
    field!("LowLimitPrice", COMPACT_DECIMAL, profile_low_limit, default_nan),
    field!("Description", STRING, profile_description, default_text),
];

const MARKET_MAKER_FIELDS: &[FieldInfo] = &[
    field!("MMExchange", UTF_CHAR, mm_exchange, default_char),
    field!("MMID", CHAR_ARRAY, mm_id, default_text),
    field!("MMBid.Price", COMPACT_DECIMAL, mm_bid_price, default_nan),
    field!("MMBid.Size", COMPACT_DECIMAL, mm_bid_size, default_nan),
    field!("MMAsk.Price", COMPACT_DECIMAL, mm_ask_price, default_nan),
    field!("MMAsk.Size", COMPACT_DECIMAL, mm_ask_size, default_nan),
];

const TIME_AND_SALE_FIELDS: &[FieldInfo] = &[
    field!("Time", COMPACT, tns_time, default_zero),
    field!("Sequence", COMPACT, tns_sequence, default_zero),
    field!("ExchangeCode", UTF_CHAR, tns_exchange, default_char),
    field!("Price", COMPACT_DECIMAL, tns_price, default_nan),
    field!("Size", COMPACT_DECIMAL, tns_size, default_nan),
    field!("Bid.Price", COMPACT_DECIMAL, tns_bid_price, default_nan),
    field!("Ask.Price", COMPACT_DECIMAL, tns_ask_price, default_nan),
    field!("ExchangeSaleConditions", CHAR_ARRAY, tns_conditions, default_text),
    field!("Flags", COMPACT, tns_flags, default_zero),
];

pub(crate) const ORDER_FIELDS: &[FieldInfo] = &[
    field!("Index", COMPACT, order_index, default_zero),
    field!("Time", COMPACT, order_time, default_zero),
    field!("Sequence", COMPACT, order_sequence, default_zero),
    field!("Price", COMPACT_DECIMAL, order_price, default_nan),
    field!("Size", COMPACT_DECIMAL, order_size, default_nan),
    field!("OrderSide", COMPACT, order_side, default_zero),
    field!("ExchangeCode", UTF_CHAR, order_exchange, default_char),
    field!("MarketMaker", CHAR_ARRAY, order_market_maker, default_text),
    field!("Flags", COMPACT, order_flags, default_zero),
];

/// The static part of the roster; dynamic `Order#SRC` records append after
/// these, so the base ids are stable per connection.
pub(crate) fn base_records() -> Vec<RecordInfo> {
    vec![
        RecordInfo {
            name: "Trade".to_string(),
            kind: RecordKind::Trade,
            fields: TRADE_FIELDS,
        },
        RecordInfo {
            name: "Quote".to_string(),
            kind: RecordKind::Quote,
            fields: QUOTE_FIELDS,
        },
        RecordInfo {
            name: "Summary".to_string(),
            kind: RecordKind::Summary,
            fields: SUMMARY_FIELDS,
        },
        RecordInfo {
            name: "Profile".to_string(),
            kind: RecordKind::Profile,
            fields: PROFILE_FIELDS,
        },
        RecordInfo {
            name: "MarketMaker".to_string(),
            kind: RecordKind::MarketMaker,
            fields: MARKET_MAKER_FIELDS,
        },
        RecordInfo {
            name: "TimeAndSale".to_string(),
            kind: RecordKind::TimeAndSale,
            fields: TIME_AND_SALE_FIELDS,
        },
    ]
}

/// Turns a decoded record into the events it carries.
///
/// Quote records additionally yield the two composite (or regional, for
/// exchange-suffixed records) book sides; market-maker records yield the
/// two aggregate book sides. The order-source tags assigned here are what
/// the subscription manager's source filter matches against.
pub(crate) fn transcode(
    data: RecordData,
    exchange_code: char,
    source_suffix: Option<&str>,
) -> Vec<(EventData, EventParams)> {
    match data {
        RecordData::Trade(mut t) => {
            if exchange_code != '\0' {
                t.exchange_code = exchange_code;
            }
            let params = EventParams {
                time_int_field: t.time,
                ..EventParams::default()
            };
            vec![(EventData::Trade(t), params)]
        }
        RecordData::Summary(s) => vec![(EventData::Summary(s), EventParams::default())],
        RecordData::Profile(p) => vec![(EventData::Profile(p), EventParams::default())],
        RecordData::TimeAndSale(t) => {
            let params = EventParams {
                flags: t.event_flags,
                time_int_field: t.time,
                ..EventParams::default()
            };
            vec![(EventData::TimeAndSale(t), params)]
        }
        RecordData::Quote(mut q) => {
            if exchange_code != '\0' {
                if q.bid_exchange_code == '\0' {
                    q.bid_exchange_code = exchange_code;
                }
                if q.ask_exchange_code == '\0' {
                    q.ask_exchange_code = exchange_code;
                }
            }
            let regional = exchange_code != '\0';
            let (bid_tag, ask_tag) = if regional {
                (SpecialSource::RegionalBid, SpecialSource::RegionalAsk)
            } else {
                (SpecialSource::CompositeBid, SpecialSource::CompositeAsk)
            };
            let bid = Order {
                time: q.bid_time,
                price: q.bid_price,
                size: q.bid_size,
                side: OrderSide::Buy,
                exchange_code: q.bid_exchange_code,
                source: bid_tag.as_str().to_string(),
                ..Order::default()
            };
            let ask = Order {
                time: q.ask_time,
                price: q.ask_price,
                size: q.ask_size,
                side: OrderSide::Sell,
                exchange_code: q.ask_exchange_code,
                source: ask_tag.as_str().to_string(),
                ..Order::default()
            };
            let params = EventParams {
                time_int_field: q.bid_time.max(q.ask_time),
                ..EventParams::default()
            };
            vec![
                (EventData::Quote(q), params.clone()),
                (EventData::Order(bid), params.clone()),
                (EventData::Order(ask), params),
            ]
        }
        RecordData::MarketMaker(m) => {
            let bid = Order {
                price: m.bid_price,
                size: m.bid_size,
                side: OrderSide::Buy,
                exchange_code: m.exchange,
                source: SpecialSource::AggregateBid.as_str().to_string(),
                market_maker: m.id.clone(),
                ..Order::default()
            };
            let ask = Order {
                price: m.ask_price,
                size: m.ask_size,
                side: OrderSide::Sell,
                exchange_code: m.exchange,
                source: SpecialSource::AggregateAsk.as_str().to_string(),
                market_maker: m.id,
                ..Order::default()
            };
            vec![
                (EventData::Order(bid), EventParams::default()),
                (EventData::Order(ask), EventParams::default()),
            ]
        }
        RecordData::Order(o) => {
            let order = Order {
                index: i64::from(o.index),
                time: o.time,
                sequence: o.sequence,
                price: o.price,
                size: o.size,
                side: o.side,
                exchange_code: if o.exchange_code == '\0' {
                    exchange_code
                } else {
                    o.exchange_code
                },
                source: source_suffix.unwrap_or_default().to_string(),
                market_maker: o.market_maker,
                event_flags: o.event_flags,
            };
            let params = EventParams {
                flags: order.event_flags,
                time_int_field: order.time,
                ..EventParams::default()
            };
            vec![(EventData::Order(order), params)]
        }
    }
}
