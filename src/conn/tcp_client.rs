//! The transport beneath one connection.
//!
//! Only the plain TCP transport is built in; TLS and gzip are negotiated
//! address data for an embedding transport layer, and the connection
//! engine refuses to dial codec-bearing entries rather than silently
//! speaking plaintext.

use crate::FeedResult;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum TcpClient {
    Plain(PlainTcpClient),
}

impl TcpClient {
    pub fn try_new(target: SocketAddr) -> FeedResult<Self> {
        Ok(Self::Plain(PlainTcpClient::try_new(target)?))
    }

    /// An independent handle for the reader thread; the writer half stays
    /// behind the send mutex.
    pub fn reader(&self) -> FeedResult<TcpStream> {
        match self {
            Self::Plain(client) => Ok(client.reader.try_clone()?),
        }
    }

    pub fn writer(&mut self) -> &mut TcpStream {
        match self {
            Self::Plain(client) => &mut client.writer,
        }
    }

    /// Shuts the socket down in both directions, unblocking a reader
    /// parked in `recv`.
    pub fn shutdown(&self) {
        match self {
            Self::Plain(client) => {
                let _ = client.reader.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct PlainTcpClient {
    reader: TcpStream,
    writer: TcpStream,
}

impl PlainTcpClient {
    fn try_new(target: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect_timeout(&target, Duration::from_secs(10))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            writer: stream.try_clone()?,
            reader: stream,
        })
    }
}
