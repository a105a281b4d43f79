//! A synchronous client for the QD-style binary market-data feed protocol.
//!
//! `feedconnect` maintains a long-lived TCP connection to a feed server,
//! negotiates the binary framing protocol (`DESCRIBE_PROTOCOL` /
//! `DESCRIBE_RECORDS`), subscribes to typed market events for instrument
//! symbols, decodes the inbound record stream, and dispatches typed events
//! to user callbacks.
//!
//! Entry point is [`Runtime`]: create one per process, then dial with
//! [`Runtime::connect`]. A [`Connection`] owns two background threads — a
//! socket reader that drives the inbound pipeline (user callbacks run on
//! it) and a task runner that serializes all outbound frames. Public calls
//! never touch the socket directly.
//!
//! ```rust,no_run
//! use feedconnect::{EventTypes, FeedConfiguration, FeedResult, Runtime};
//!
//! fn main() -> FeedResult<()> {
//!     let runtime = Runtime::new();
//!     let connection = runtime.connect("demo.feed.example:7300", FeedConfiguration::default())?;
//!     let subscription = connection.create_subscription(EventTypes::TRADE)?;
//!     subscription.add_listener(|symbol, data| {
//!         println!("{symbol}: {data:?}");
//!     })?;
//!     subscription.add_symbols(&["IBM", "MSFT"])?;
//!     std::thread::park();
//!     Ok(())
//! }
//! ```

#![deny(missing_debug_implementations)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

mod conn;
mod events;
mod feed_error;
mod last_error;
mod protocol;
mod records;
mod runtime;
mod subscription;

pub use crate::conn::{Address, AddressList, FeedConfiguration, TlsOptions};
pub use crate::events::{
    EventData, EventFlags, EventParams, EventType, EventTypes, Order, OrderSide, Profile, Quote,
    SpecialSource, Summary, TimeAndSale, Trade, PUBLISHED_ORDER_SOURCES,
};
pub use crate::feed_error::{FeedError, FeedResult};
pub use crate::last_error::pop_last_error;
pub use crate::protocol::{MessageSupport, MessageType};
pub use crate::runtime::Runtime;
pub use crate::subscription::{ListenerId, Subscription, SubscriptionFlags};

pub use crate::conn::Connection;

/// The protocol version string announced in `DESCRIBE_PROTOCOL`.
pub const PROTOCOL_VERSION: &str = concat!("feedconnect/", env!("CARGO_PKG_VERSION"));
