//! Message types with their fixed wire ids, and the send/receive rosters
//! whose indexes key the negotiated support bitmasks.

/// A message type of the feed protocol. The wire ids are fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Zero-length keep-alive.
    Heartbeat = 0,
    /// Protocol handshake: properties plus the send/receive rosters.
    DescribeProtocol = 1,
    /// Record schema announcement.
    DescribeRecords = 2,
    /// Ticker (last value) data.
    TickerData = 10,
    TickerAddSubscription = 11,
    TickerRemoveSubscription = 12,
    /// Stream (every event) data.
    StreamData = 15,
    StreamAddSubscription = 16,
    StreamRemoveSubscription = 17,
    /// History (time series) data.
    HistoryData = 20,
    HistoryAddSubscription = 21,
    HistoryRemoveSubscription = 22,
}

/// First byte of a text-format stream; a binary session must reject it.
pub(crate) const TEXT_FORMAT_SENTINEL: i64 = 0x3D;
/// Second byte of zip compression; reserved, never a message type.
pub(crate) const ZIP_SENTINEL: i64 = 0x4B;
/// Second byte of gzip compression; reserved, never a message type.
pub(crate) const GZIP_SENTINEL: i64 = 0x8B;

impl MessageType {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn id(self) -> i32 {
        self as i32
    }

    pub(crate) fn try_from_wire(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::Heartbeat),
            1 => Some(Self::DescribeProtocol),
            2 => Some(Self::DescribeRecords),
            10 => Some(Self::TickerData),
            11 => Some(Self::TickerAddSubscription),
            12 => Some(Self::TickerRemoveSubscription),
            15 => Some(Self::StreamData),
            16 => Some(Self::StreamAddSubscription),
            17 => Some(Self::StreamRemoveSubscription),
            20 => Some(Self::HistoryData),
            21 => Some(Self::HistoryAddSubscription),
            22 => Some(Self::HistoryRemoveSubscription),
            _ => None,
        }
    }

    /// The wire name, as exchanged in `DESCRIBE_PROTOCOL` rosters.
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::DescribeProtocol => "DESCRIBE_PROTOCOL",
            Self::DescribeRecords => "DESCRIBE_RECORDS",
            Self::TickerData => "TICKER_DATA",
            Self::TickerAddSubscription => "TICKER_ADD_SUBSCRIPTION",
            Self::TickerRemoveSubscription => "TICKER_REMOVE_SUBSCRIPTION",
            Self::StreamData => "STREAM_DATA",
            Self::StreamAddSubscription => "STREAM_ADD_SUBSCRIPTION",
            Self::StreamRemoveSubscription => "STREAM_REMOVE_SUBSCRIPTION",
            Self::HistoryData => "HISTORY_DATA",
            Self::HistoryAddSubscription => "HISTORY_ADD_SUBSCRIPTION",
            Self::HistoryRemoveSubscription => "HISTORY_REMOVE_SUBSCRIPTION",
        }
    }

    pub(crate) fn is_data(self) -> bool {
        matches!(self, Self::TickerData | Self::StreamData | Self::HistoryData)
    }

    pub(crate) fn is_subscription(self) -> bool {
        matches!(
            self,
            Self::TickerAddSubscription
                | Self::TickerRemoveSubscription
                | Self::StreamAddSubscription
                | Self::StreamRemoveSubscription
                | Self::HistoryAddSubscription
                | Self::HistoryRemoveSubscription
        )
    }
}

/// Messages this client sends, in roster order. Bit `i` of the negotiated
/// send bitmask refers to `SEND_ROSTER[i]`.
pub(crate) const SEND_ROSTER: &[MessageType] = &[
    MessageType::Heartbeat,
    MessageType::DescribeProtocol,
    MessageType::DescribeRecords,
    MessageType::TickerAddSubscription,
    MessageType::TickerRemoveSubscription,
    MessageType::StreamAddSubscription,
    MessageType::StreamRemoveSubscription,
    MessageType::HistoryAddSubscription,
    MessageType::HistoryRemoveSubscription,
];

/// Messages this client receives, in roster order.
pub(crate) const RECV_ROSTER: &[MessageType] = &[
    MessageType::Heartbeat,
    MessageType::DescribeProtocol,
    MessageType::DescribeRecords,
    MessageType::TickerData,
    MessageType::StreamData,
    MessageType::HistoryData,
];

/// The subscription messages assumed sendable when the server never
/// answers `DESCRIBE_PROTOCOL`.
pub(crate) const LEGACY_SEND: &[MessageType] = &[
    MessageType::TickerAddSubscription,
    MessageType::TickerRemoveSubscription,
    MessageType::StreamAddSubscription,
    MessageType::StreamRemoveSubscription,
    MessageType::HistoryAddSubscription,
    MessageType::HistoryRemoveSubscription,
];

/// The data messages assumed receivable under the same fallback.
pub(crate) const LEGACY_RECV: &[MessageType] = &[
    MessageType::TickerData,
    MessageType::StreamData,
    MessageType::HistoryData,
];

pub(crate) fn roster_index(roster: &[MessageType], msg: MessageType) -> Option<usize> {
    roster.iter().position(|&m| m == msg)
}

pub(crate) fn legacy_bitmask(roster: &[MessageType], legacy: &[MessageType]) -> u32 {
    let mut mask = 0u32;
    for &msg in legacy {
        let idx = roster_index(roster, msg)
            .expect("legacy messages are always present in the local rosters");
        mask |= 1 << idx;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_are_stable() {
        assert_eq!(MessageType::Heartbeat.id(), 0);
        assert_eq!(MessageType::DescribeProtocol.id(), 1);
        assert_eq!(MessageType::DescribeRecords.id(), 2);
        assert_eq!(MessageType::TickerData.id(), 10);
        assert_eq!(MessageType::TickerAddSubscription.id(), 11);
        assert_eq!(MessageType::TickerRemoveSubscription.id(), 12);
        assert_eq!(MessageType::StreamData.id(), 15);
        assert_eq!(MessageType::StreamAddSubscription.id(), 16);
        assert_eq!(MessageType::StreamRemoveSubscription.id(), 17);
        assert_eq!(MessageType::HistoryData.id(), 20);
        assert_eq!(MessageType::HistoryAddSubscription.id(), 21);
        assert_eq!(MessageType::HistoryRemoveSubscription.id(), 22);
    }

    #[test]
    fn sentinels_are_not_message_types() {
        assert!(MessageType::try_from_wire(TEXT_FORMAT_SENTINEL).is_none());
        assert!(MessageType::try_from_wire(ZIP_SENTINEL).is_none());
        assert!(MessageType::try_from_wire(GZIP_SENTINEL).is_none());
    }

    #[test]
    fn legacy_masks_cover_exactly_the_legacy_messages() {
        let send = legacy_bitmask(SEND_ROSTER, LEGACY_SEND);
        assert_eq!(send.count_ones(), 6);
        let recv = legacy_bitmask(RECV_ROSTER, LEGACY_RECV);
        assert_eq!(recv.count_ones(), 3);
    }
}
