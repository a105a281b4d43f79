//! Wire-level scenarios against an in-process mock feed server: the
//! handshake, schema negotiation, deferred subscriptions, data decoding,
//! the timeout fallback, and reconnect-with-resubscribe.

mod test_utils;

use feedconnect::{
    EventData, EventTypes, FeedConfiguration, MessageSupport, MessageType, Runtime,
};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use test_utils::{decimal, put_compact_int, MockServer, ServerSession, IBM_PENTA};

const TRADE_FIELDS_ON_WIRE: usize = 8;

fn recv_config() -> FeedConfiguration {
    FeedConfiguration::default().with_disable_last_event_storage(false)
}

/// Parses a client `DESCRIBE_RECORDS` body into (id, name, field count).
fn parse_describe_records(frame: &test_utils::Frame) -> Vec<(i64, String, usize)> {
    let mut cursor = frame.cursor();
    let mut records = Vec::new();
    while cursor.remaining() > 0 {
        let id = cursor.compact_long();
        let name = cursor.utf_string().expect("record name");
        let field_count = usize::try_from(cursor.compact_long()).unwrap();
        for _ in 0..field_count {
            cursor.utf_string().expect("field name");
            cursor.compact_long();
        }
        records.push((id, name, field_count));
    }
    records
}

/// Reads frames until one of `expected` type arrives; panics on others.
fn expect_message(session: &mut ServerSession, expected: i64) -> test_utils::Frame {
    let frame = session
        .next_message(Duration::from_secs(5))
        .unwrap_or_else(|| panic!("expected a frame of type {expected}, got nothing"));
    assert_eq!(frame.message_type(), expected, "unexpected frame type");
    frame
}

fn handshake_reply(session: &mut ServerSession) {
    // DESCRIBE_PROTOCOL and DESCRIBE_RECORDS in one segment so the client
    // sees them in one read
    let mut bytes = Vec::new();
    let dp = ServerSession::describe_protocol_body(
        &[(10, "TICKER_DATA")],
        &[(11, "TICKER_ADD_SUBSCRIPTION"), (12, "TICKER_REMOVE_SUBSCRIPTION")],
    );
    put_compact_int(&mut bytes, dp.len() as i32);
    bytes.extend_from_slice(&dp);
    let dr = ServerSession::describe_records_body(&[(
        5,
        "Trade",
        &[("Price", 0x15), ("Size", 0x15)],
    )]);
    put_compact_int(&mut bytes, dr.len() as i32);
    bytes.extend_from_slice(&dr);
    session.send(&bytes);
}

fn ticker_data_ibm(price_mantissa: i32) -> Vec<u8> {
    let mut body = Vec::new();
    put_compact_int(&mut body, 10); // TICKER_DATA
    body.extend_from_slice(&IBM_PENTA);
    put_compact_int(&mut body, 5); // the server id assigned to Trade
    put_compact_int(&mut body, decimal(price_mantissa, 1)); // Price
    put_compact_int(&mut body, decimal(100, 0)); // Size
    body
}

fn wait_for_support(
    connection: &feedconnect::Connection,
    message: MessageType,
) -> MessageSupport {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let support = connection.is_message_supported(message).unwrap();
        if support != MessageSupport::Pending || Instant::now() > deadline {
            return support;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn connect_subscribe_decode_and_reconnect() {
    test_utils::init_logger();
    let server = MockServer::start();
    let runtime = Runtime::new();
    let connection = runtime.connect(&server.address(), recv_config()).unwrap();
    let mut session = server.accept(Duration::from_secs(2));

    // S1: DESCRIBE_PROTOCOL leads, magic first, version and heartbeat
    // option announced, and nothing else goes out yet.
    let started = Instant::now();
    let dp = expect_message(&mut session, 1);
    assert!(started.elapsed() < Duration::from_millis(2000));
    let mut cursor = dp.cursor();
    assert_eq!(cursor.bytes(4), b"DXP3");
    let prop_count = cursor.compact_long();
    let mut saw_version = false;
    let mut saw_heartbeat_opt = false;
    for _ in 0..prop_count {
        let key = cursor.utf_string().unwrap();
        let value = cursor.utf_string().unwrap();
        match key.as_str() {
            "version" => saw_version = !value.is_empty(),
            "opt" => saw_heartbeat_opt = value == "hs",
            _ => {}
        }
    }
    assert!(saw_version, "version property missing");
    assert!(saw_heartbeat_opt, "opt=hs property missing");
    // both rosters are present and name their messages
    for _ in 0..2 {
        let count = cursor.compact_long();
        assert!(count > 0);
        for _ in 0..count {
            cursor.compact_long();
            assert!(cursor.utf_string().is_some());
            assert_eq!(cursor.compact_long(), 0);
        }
    }
    assert_eq!(cursor.remaining(), 0);

    assert_eq!(
        connection
            .is_message_supported(MessageType::TickerAddSubscription)
            .unwrap(),
        MessageSupport::Pending
    );

    // S4 part one: subscribing while the handshake is pending emits
    // nothing.
    let subscription = connection.create_subscription(EventTypes::TRADE).unwrap();
    let (tx, rx) = mpsc::channel::<EventData>();
    subscription
        .add_listener(move |symbol, data| {
            assert_eq!(symbol, "IBM");
            tx.send(data.clone()).unwrap();
        })
        .unwrap();
    subscription.add_symbols(&["IBM"]).unwrap();
    session.expect_quiet(Duration::from_millis(300));

    // S2: the server answers; support resolves per its rosters.
    handshake_reply(&mut session);
    assert_eq!(
        wait_for_support(&connection, MessageType::TickerAddSubscription),
        MessageSupport::Supported
    );
    assert_eq!(
        connection
            .is_message_supported(MessageType::StreamAddSubscription)
            .unwrap(),
        MessageSupport::NotSupported
    );

    // S4 part two: the deferred subscription now flows — the client's
    // DESCRIBE_RECORDS first, then TICKER_ADD with the server's record id.
    let dr = expect_message(&mut session, 2);
    let records = parse_describe_records(&dr);
    let trade = records.iter().find(|(_, name, _)| name == "Trade").unwrap();
    assert_eq!(trade.2, TRADE_FIELDS_ON_WIRE);
    assert!(records.iter().any(|(_, name, _)| name == "Quote"));

    let add = expect_message(&mut session, 11);
    let mut cursor = add.cursor();
    assert_eq!(cursor.bytes(2), &IBM_PENTA);
    assert_eq!(cursor.compact_long(), 5, "subscription must quote the server's record id");
    assert_eq!(cursor.remaining(), 0);

    // S5: one data frame decodes into one listener invocation with the
    // decoded values, and the last-event cache agrees. A heartbeat frame
    // in front must be consumed silently.
    session.send_heartbeat();
    session.send_frame(&ticker_data_ibm(1235));
    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    match &event {
        EventData::Trade(trade) => {
            assert!((trade.price - 123.5).abs() < 1e-9);
            assert!((trade.size - 100.0).abs() < 1e-9);
        }
        other => panic!("expected a trade, got {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "one event only");
    match connection.get_last_event("IBM", EventTypes::TRADE).unwrap() {
        Some(EventData::Trade(trade)) => assert!((trade.price - 123.5).abs() < 1e-9),
        other => panic!("unexpected last event {other:?}"),
    }

    // S6: drop the socket; the client reconnects, replays the handshake
    // and the subscription, and the listener keeps working.
    session.shutdown();
    let dropped = Instant::now();
    let mut session = server.accept(Duration::from_secs(40));
    assert!(
        dropped.elapsed() >= Duration::from_secs(2),
        "reconnect must back off before re-resolving"
    );
    expect_message(&mut session, 1);
    handshake_reply(&mut session);
    let dr = expect_message(&mut session, 2);
    assert!(parse_describe_records(&dr).iter().any(|(_, n, _)| n == "Trade"));
    let add = expect_message(&mut session, 11);
    let mut cursor = add.cursor();
    assert_eq!(cursor.bytes(2), &IBM_PENTA);
    assert_eq!(cursor.compact_long(), 5);

    session.send_frame(&ticker_data_ibm(1300));
    match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        EventData::Trade(trade) => assert!((trade.price - 130.0).abs() < 1e-9),
        other => panic!("expected a trade, got {other:?}"),
    }

    connection.close().unwrap();
    assert!(connection.create_subscription(EventTypes::QUOTE).is_err());
}

#[test]
fn handshake_timeout_falls_back_to_the_legacy_message_set() {
    test_utils::init_logger();
    let server = MockServer::start();
    let runtime = Runtime::new();
    let connection = runtime.connect(&server.address(), recv_config()).unwrap();
    let mut session = server.accept(Duration::from_secs(2));
    expect_message(&mut session, 1);

    // S3: the server stays silent past the 3000 ms boundary.
    std::thread::sleep(Duration::from_millis(3400));
    for message in [
        MessageType::TickerAddSubscription,
        MessageType::TickerRemoveSubscription,
        MessageType::StreamAddSubscription,
        MessageType::StreamRemoveSubscription,
        MessageType::HistoryAddSubscription,
        MessageType::HistoryRemoveSubscription,
        MessageType::TickerData,
        MessageType::StreamData,
        MessageType::HistoryData,
    ] {
        assert_eq!(
            connection.is_message_supported(message).unwrap(),
            MessageSupport::Supported,
            "{message:?} must be granted by the legacy fallback"
        );
    }
    assert_eq!(
        connection
            .is_message_supported(MessageType::DescribeRecords)
            .unwrap(),
        MessageSupport::NotSupported
    );

    // The roster went out unanswered, so subscriptions quote the client's
    // own record numbering.
    let dr = expect_message(&mut session, 2);
    assert!(!parse_describe_records(&dr).is_empty());

    let subscription = connection.create_subscription(EventTypes::TRADE).unwrap();
    subscription.add_symbols(&["IBM"]).unwrap();
    let add = expect_message(&mut session, 11);
    let mut cursor = add.cursor();
    assert_eq!(cursor.bytes(2), &IBM_PENTA);
    assert_eq!(cursor.compact_long(), 0, "the local Trade id");

    connection.close().unwrap();
}

#[test]
fn split_frames_rewind_at_the_length_prefix() {
    test_utils::init_logger();
    let server = MockServer::start();
    let runtime = Runtime::new();
    let connection = runtime.connect(&server.address(), recv_config()).unwrap();
    let mut session = server.accept(Duration::from_secs(2));
    expect_message(&mut session, 1);

    let subscription = connection.create_subscription(EventTypes::TRADE).unwrap();
    let (tx, rx) = mpsc::channel::<EventData>();
    subscription
        .add_listener(move |_, data| tx.send(data.clone()).unwrap())
        .unwrap();
    subscription.add_symbols(&["IBM"]).unwrap();

    handshake_reply(&mut session);
    expect_message(&mut session, 2);
    expect_message(&mut session, 11);

    // deliver a data frame in three slices: the length prefix alone, a
    // partial body, then the rest
    let body = ticker_data_ibm(1235);
    let mut frame = Vec::new();
    put_compact_int(&mut frame, body.len() as i32);
    frame.extend_from_slice(&body);
    session.send(&frame[..1]);
    std::thread::sleep(Duration::from_millis(120));
    assert!(rx.try_recv().is_err(), "no event before the frame completes");
    session.send(&frame[1..4]);
    std::thread::sleep(Duration::from_millis(120));
    assert!(rx.try_recv().is_err(), "no event before the frame completes");
    session.send(&frame[4..]);
    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(event, EventData::Trade(_)));

    // the stream is still in sync afterwards
    session.send_frame(&ticker_data_ibm(1300));
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());

    connection.close().unwrap();
}

#[test]
fn heartbeats_flow_on_the_configured_period() {
    test_utils::init_logger();
    let server = MockServer::start();
    let runtime = Runtime::new();
    let config = recv_config().with_heartbeat_period(Duration::from_secs(1));
    let connection = runtime.connect(&server.address(), config).unwrap();
    let mut session = server.accept(Duration::from_secs(2));
    expect_message(&mut session, 1);

    let deadline = Instant::now() + Duration::from_secs(4);
    let mut heartbeats = 0;
    while Instant::now() < deadline && heartbeats == 0 {
        if let Some(frame) = session.read_raw_frame(Duration::from_millis(200)) {
            if frame.body.is_empty() {
                heartbeats += 1;
            }
        }
    }
    assert!(heartbeats > 0, "no heartbeat within the period");

    connection.close().unwrap();
}

#[test]
fn unknown_message_types_are_skipped_without_desync() {
    test_utils::init_logger();
    let server = MockServer::start();
    let runtime = Runtime::new();
    let connection = runtime.connect(&server.address(), recv_config()).unwrap();
    let mut session = server.accept(Duration::from_secs(2));
    expect_message(&mut session, 1);

    let subscription = connection.create_subscription(EventTypes::TRADE).unwrap();
    let (tx, rx) = mpsc::channel::<EventData>();
    subscription
        .add_listener(move |_, data| tx.send(data.clone()).unwrap())
        .unwrap();
    subscription.add_symbols(&["IBM"]).unwrap();

    handshake_reply(&mut session);
    expect_message(&mut session, 2);
    expect_message(&mut session, 11);

    // a frame with a roster-unknown type is skipped whole
    let mut unknown = Vec::new();
    put_compact_int(&mut unknown, 49); // an RMI-range id this client ignores
    unknown.extend_from_slice(&[1, 2, 3, 4]);
    session.send_frame(&unknown);
    session.send_frame(&ticker_data_ibm(1235));
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());

    connection.close().unwrap();
}
