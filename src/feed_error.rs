use thiserror::Error;

/// A list specifying the categories of errors that can occur in `feedconnect`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FeedError {
    /// The remote side closed the connection in an orderly way.
    ///
    /// This is informational; the engine reacts by reconnecting when
    /// reconnects are enabled.
    #[error("Connection was gracefully closed by the remote side")]
    ConnectionGracefullyClosed,

    /// None of the configured hosts could be resolved to an address.
    #[error("Host could not be resolved: {host}")]
    HostNotFound {
        /// The host part of the failing address entry.
        host: String,
    },

    /// Error occurred in communication with the feed server.
    #[error(transparent)]
    Io {
        /// The causing error.
        #[from]
        source: std::io::Error,
    },

    /// Error occurred in thread synchronization.
    #[error("Error occurred in thread synchronization")]
    Poison,

    /// Fewer bytes remained in the decode buffer than the value required.
    ///
    /// At the framing layer this is informational: the cursor is rewound
    /// and decoding resumes once more bytes arrive.
    #[error("Buffer underflow while decoding")]
    BufferUnderflow,

    /// The outbound buffer could not accommodate the value.
    #[error("Buffer overflow while encoding")]
    BufferOverflow,

    /// A UTF sequence on the wire was malformed.
    #[error("Malformed UTF sequence on the wire")]
    BadUtfFormat,

    /// A penta-coded symbol used a reserved or malformed serial form.
    #[error("Malformed symbol encoding on the wire")]
    BadSymbolFormat,

    /// A record field used a serialization kind this client does not know.
    #[error("Record field type {0:#04x} is not supported")]
    UnsupportedFieldType(i32),

    /// A frame carried a message type outside the known roster.
    #[error("Unexpected message type {0}")]
    UnexpectedMessageType(i64),

    /// A frame length was negative, oversized, or inconsistent with its body.
    ///
    /// The stream is considered desynchronized; the connection is dropped
    /// and re-established.
    #[error("Invalid message length")]
    InvalidMessageLength,

    /// A frame is not yet complete; informational, more data is awaited.
    #[error("Message is incomplete, more data is needed")]
    MessageIncomplete,

    /// The `DESCRIBE_PROTOCOL` body failed validation (bad magic or counts).
    #[error("DESCRIBE_PROTOCOL message is corrupted")]
    DescribeProtocolCorrupted,

    /// DATA arrived for a record before its `DESCRIBE_RECORDS` entry.
    #[error("Record description for {0:?} has not been received")]
    RecordDescriptionNotReceived(String),

    /// DATA referenced a record id unknown to this connection.
    #[error("Record id {0} is not supported")]
    RecordNotSupported(i32),

    /// A record was referenced by a name this client does not know.
    #[error("Record name {0:?} is unknown")]
    UnknownRecordName(String),

    /// A `DESCRIBE_RECORDS` entry failed validation.
    #[error("Record description is corrupted")]
    RecordInfoCorrupted,

    /// One operation would mix messages with known and pending support.
    #[error("Inconsistent message support within one operation")]
    InconsistentMessageSupport,

    /// The server sent a message this client does not process; the frame
    /// is skipped.
    #[error("Server message is not supported")]
    ServerMessageNotSupported,

    /// The negotiated protocol lacks a message this operation requires.
    #[error("Message is not supported by the server")]
    LocalMessageNotSupportedByServer,

    /// A port value in an address string was out of range.
    #[error("Invalid port value: {0}")]
    InvalidPortValue(String),

    /// An address entry named a codec this client does not know.
    #[error("Unknown address codec: {0}")]
    UnknownCodec(String),

    /// An argument failed validation.
    #[error("Invalid argument: {0}")]
    InvalidFunctionArg(String),

    /// The connection is closed; no further I/O is possible.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The event-type bitmask was empty or denoted no known event.
    #[error("Invalid event type bitmask {0:#x}")]
    InvalidEventType(u32),

    /// A symbol name was empty or undecodable.
    #[error("Invalid symbol name")]
    InvalidSymbolName,

    /// A listener id did not denote a live listener of the subscription.
    #[error("Invalid listener")]
    InvalidListener,

    /// The subscription no longer exists on its connection.
    #[error("Invalid subscription")]
    InvalidSubscription,

    /// The configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    Usage(&'static str),

    /// Implementation error.
    #[error("Implementation error: {}", _0)]
    Impl(&'static str),
}

/// Abbreviation of `Result<T, FeedError>`.
pub type FeedResult<T> = std::result::Result<T, FeedError>;

impl FeedError {
    /// Reveal the inner error, if any.
    #[must_use]
    pub fn inner(&self) -> Option<&dyn std::error::Error> {
        match self {
            Self::Io { source } => Some(source),
            _ => None,
        }
    }

    /// Returns a decently formed and hopefully helpful error description.
    #[must_use]
    pub fn display_with_inner(&self) -> String {
        if let Some(e) = self.inner() {
            format!("{}, caused by {:?}", &self, e)
        } else {
            format!("{}", &self)
        }
    }

    /// True for the conditions the framing layer absorbs by waiting for
    /// more data instead of failing the stream.
    #[must_use]
    pub(crate) fn is_incomplete(&self) -> bool {
        matches!(self, Self::BufferUnderflow | Self::MessageIncomplete)
    }
}

impl<G> From<std::sync::PoisonError<G>> for FeedError {
    fn from(_error: std::sync::PoisonError<G>) -> Self {
        Self::Poison
    }
}
