//! An in-process mock feed server for the wire-level tests, with its own
//! minimal implementation of the frame codec so the tests do not trust
//! the crate under test for their arithmetic.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::time::{Duration, Instant};

pub fn init_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        flexi_logger::Logger::try_with_env_or_str("info")
            .unwrap()
            .start()
            .ok();
    });
}

// ---------------------------------------------------------------------------
// minimal wire codec
// ---------------------------------------------------------------------------

pub fn put_compact_int(out: &mut Vec<u8>, v: i32) {
    if (-0x40..0x40).contains(&v) {
        out.push((v & 0x7F) as u8);
    } else if (-0x2000..0x2000).contains(&v) {
        let w = ((v & 0x3FFF) | 0x8000_u32 as i32) as u16;
        out.extend_from_slice(&w.to_be_bytes());
    } else if (-0x0010_0000..0x0010_0000).contains(&v) {
        out.push((0xC0 | ((v >> 16) & 0x1F)) as u8);
        out.extend_from_slice(&(v as u16).to_be_bytes());
    } else if (-0x0800_0000..0x0800_0000).contains(&v) {
        out.extend_from_slice(
            &(((v & 0x0FFF_FFFF) | 0xE000_0000_u32 as i32) as u32).to_be_bytes(),
        );
    } else {
        out.push(if v < 0 { 0xF7 } else { 0xF0 });
        out.extend_from_slice(&(v as u32).to_be_bytes());
    }
}

pub fn put_utf_string(out: &mut Vec<u8>, s: &str) {
    put_compact_int(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// mantissa × 10^−decimals in the feed's decimal field encoding
pub fn decimal(mantissa: i32, decimals: i32) -> i32 {
    (mantissa << 4) | (9 + decimals)
}

/// "IBM" in its 15-bit penta serial form
pub const IBM_PENTA: [u8; 2] = [0x24, 0x4D];

/// Decodes one compact long at `pos`, or `None` if the bytes are not all
/// there yet.
pub fn take_compact_long(data: &[u8], pos: &mut usize) -> Option<i64> {
    let first = i64::from(*data.get(*pos)?);
    let total: usize = match first {
        0x00..=0x7F => 1,
        0x80..=0xBF => 2,
        0xC0..=0xDF => 3,
        0xE0..=0xEF => 4,
        0xF0..=0xF7 => 5,
        0xF8..=0xFB => 6,
        0xFC..=0xFD => 7,
        0xFE => 8,
        _ => 9,
    };
    if *pos + total > data.len() {
        return None;
    }
    let bytes = &data[*pos..*pos + total];
    *pos += total;
    let b = |i: usize| i64::from(bytes[i]);
    let low32 = |from: usize| {
        (b(from) << 24) | (b(from + 1) << 16) | (b(from + 2) << 8) | b(from + 3)
    };
    let value = match total {
        1 => (first << 57) >> 57,
        2 => (((first << 8) | b(1)) << 50) >> 50,
        3 => (((first << 16) | (b(1) << 8) | b(2)) << 43) >> 43,
        4 => (((first << 24) | (b(1) << 16) | (b(2) << 8) | b(3)) << 36) >> 36,
        5 => (((first << 61) >> 61) << 32) | low32(1),
        6 => (((first << 62) >> 62) << 40) | (b(1) << 32) | low32(2),
        7 => (((first << 63) >> 63) << 48) | (b(1) << 40) | (b(2) << 32) | low32(3),
        8 => (i64::from(bytes[1] as i8) << 48) | (b(2) << 40) | (b(3) << 32) | low32(4),
        _ => {
            let mut acc = 0i64;
            for &x in &bytes[1..] {
                acc = (acc << 8) | i64::from(x);
            }
            acc
        }
    };
    Some(value)
}

/// A parsed frame body (without the length prefix).
pub struct Frame {
    pub body: Vec<u8>,
}

impl Frame {
    pub fn message_type(&self) -> i64 {
        if self.body.is_empty() {
            return 0; // heartbeat
        }
        let mut pos = 0;
        take_compact_long(&self.body, &mut pos).expect("message type")
    }

    /// A cursor positioned after the message type.
    pub fn cursor(&self) -> BodyCursor<'_> {
        let mut pos = 0;
        if !self.body.is_empty() {
            take_compact_long(&self.body, &mut pos).expect("message type");
        }
        BodyCursor {
            data: &self.body,
            pos,
        }
    }
}

pub struct BodyCursor<'a> {
    pub data: &'a [u8],
    pub pos: usize,
}

impl BodyCursor<'_> {
    pub fn compact_long(&mut self) -> i64 {
        take_compact_long(self.data, &mut self.pos).expect("compact long")
    }

    pub fn utf_string(&mut self) -> Option<String> {
        let len = self.compact_long();
        if len == -1 {
            return None;
        }
        let len = usize::try_from(len).expect("string length");
        let s = String::from_utf8(self.data[self.pos..self.pos + len].to_vec()).unwrap();
        self.pos += len;
        Some(s)
    }

    pub fn bytes(&mut self, n: usize) -> &[u8] {
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// ---------------------------------------------------------------------------
// mock server
// ---------------------------------------------------------------------------

pub struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        Self { listener }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.listener.local_addr().unwrap().port())
    }

    /// Accepts the next client connection within `timeout`.
    pub fn accept(&self, timeout: Duration) -> ServerSession {
        let deadline = Instant::now() + timeout;
        self.listener.set_nonblocking(true).unwrap();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    self.listener.set_nonblocking(false).unwrap();
                    stream.set_nodelay(true).unwrap();
                    return ServerSession {
                        stream,
                        buf: Vec::new(),
                    };
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(
                        Instant::now() < deadline,
                        "no client connection within {timeout:?}"
                    );
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }
}

pub struct ServerSession {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ServerSession {
    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Composes and sends one frame: compact body length, then the body.
    pub fn send_frame(&mut self, body: &[u8]) {
        let mut frame = Vec::new();
        put_compact_int(&mut frame, body.len() as i32);
        frame.extend_from_slice(body);
        self.send(&frame);
    }

    pub fn send_heartbeat(&mut self) {
        self.send_frame(&[]);
    }

    /// A `DESCRIBE_PROTOCOL` reply body with the given rosters.
    pub fn describe_protocol_body(sends: &[(i32, &str)], recvs: &[(i32, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        put_compact_int(&mut body, 1);
        body.extend_from_slice(b"DXP3");
        put_compact_int(&mut body, 0); // properties
        for roster in [sends, recvs] {
            put_compact_int(&mut body, roster.len() as i32);
            for (id, name) in roster {
                put_compact_int(&mut body, *id);
                put_utf_string(&mut body, name);
                put_compact_int(&mut body, 0); // message properties
            }
        }
        body
    }

    pub fn send_describe_protocol(&mut self, sends: &[(i32, &str)], recvs: &[(i32, &str)]) {
        let body = Self::describe_protocol_body(sends, recvs);
        self.send_frame(&body);
    }

    /// A `DESCRIBE_RECORDS` announcement body.
    pub fn describe_records_body(records: &[(i32, &str, &[(&str, i32)])]) -> Vec<u8> {
        let mut body = Vec::new();
        put_compact_int(&mut body, 2);
        for (id, name, fields) in records {
            put_compact_int(&mut body, *id);
            put_utf_string(&mut body, name);
            put_compact_int(&mut body, fields.len() as i32);
            for (field_name, field_type) in *fields {
                put_utf_string(&mut body, field_name);
                put_compact_int(&mut body, *field_type);
            }
        }
        body
    }

    pub fn send_describe_records(&mut self, records: &[(i32, &str, &[(&str, i32)])]) {
        let body = Self::describe_records_body(records);
        self.send_frame(&body);
    }

    /// Reads the next frame, heartbeats included.
    pub fn read_raw_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut pos = 0;
            if let Some(len) = take_compact_long(&self.buf, &mut pos) {
                let len = usize::try_from(len).expect("frame length");
                if self.buf.len() >= pos + len {
                    let body = self.buf[pos..pos + len].to_vec();
                    self.buf.drain(..pos + len);
                    return Some(Frame { body });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.stream.set_read_timeout(Some(deadline - now)).unwrap();
            let mut chunk = [0u8; 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return None;
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// Reads the next non-heartbeat frame.
    pub fn next_message(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.read_raw_frame(deadline - now) {
                Some(frame) if frame.body.is_empty() => continue,
                other => return other,
            }
        }
    }

    /// Asserts that nothing but heartbeats arrives for `window`.
    pub fn expect_quiet(&mut self, window: Duration) {
        if let Some(frame) = self.next_message(window) {
            panic!(
                "unexpected frame of type {} within the quiet window",
                frame.message_type()
            );
        }
    }

    pub fn shutdown(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
