//! Length-prefixed frame transport over a local TCP stream.
//!
//! ```text
//! [u32 BE: len][payload of len bytes]
//! ```
//!
//! Any stream-level failure (reset, EOF, write on a closed socket) surfaces as
//! `Disconnected`, so callers can tell it apart from an error carried inside
//! a well-formed response.

use super::protocol::{decode, encode, Request, Response};
use crate::config::ProtocolConfig;
use crate::error::{NetSqliteError, Result};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection between frames).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetSqliteError::disconnected(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(NetSqliteError::FrameTooLarge {
            size: len,
            max: ProtocolConfig::MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetSqliteError::disconnected(format!("truncated frame: {}", e)))?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(NetSqliteError::FrameTooLarge {
            size: payload.len(),
            max: ProtocolConfig::MAX_MESSAGE_SIZE,
        });
    }

    let len = payload.len() as u32;
    let write = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    write
        .await
        .map_err(|e| NetSqliteError::disconnected(e.to_string()))
}

/// One end of a client/server byte stream.
#[derive(Debug)]
pub struct Transport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl Transport {
    /// Connect to a server.
    ///
    /// Fails with `Unreachable` if nothing listens at `addr` or the connect
    /// does not complete within `ProtocolConfig::CONNECT_TIMEOUT`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(ProtocolConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetSqliteError::Unreachable { addr, source: None })?
            .map_err(|e| NetSqliteError::Unreachable {
                addr,
                source: Some(e),
            })?;

        debug!("Connected to {}", addr);
        Self::from_stream(stream, addr)
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Send one frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        let result = write_frame(stream, payload).await;
        if matches!(result, Err(NetSqliteError::Disconnected { .. })) {
            self.stream = None;
        }
        result
    }

    /// Receive one frame. A peer that has gone away yields `Disconnected`.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream_mut()?;
        match read_frame(stream).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                self.stream = None;
                Err(NetSqliteError::disconnected(format!(
                    "{} closed the connection",
                    self.peer
                )))
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// An error record in the response comes back as the matching error
    /// variant; the transport stays usable in that case.
    pub async fn call(&mut self, request: &Request) -> Result<Value> {
        self.send(&encode(request)?).await?;
        let frame = self.receive().await?;
        decode::<Response>(&frame)?.into_result()
    }

    /// Send a response frame (server side).
    ///
    /// A response too large for one frame is replaced by an error record, so
    /// the client never mistakes it for a lost connection.
    pub async fn respond(&mut self, response: &Response) -> Result<()> {
        let payload = encode(response)?;
        if payload.len() <= ProtocolConfig::MAX_MESSAGE_SIZE {
            return self.send(&payload).await;
        }

        let err = NetSqliteError::FrameTooLarge {
            size: payload.len(),
            max: ProtocolConfig::MAX_MESSAGE_SIZE,
        };
        warn!("Response to {} not sent: {}", self.peer, err);
        self.send(&encode(&Response::failure(&err))?).await
    }

    /// Shut the stream down. Calling this more than once is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed connection to {}", self.peer);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        let peer = self.peer;
        self.stream
            .as_mut()
            .ok_or_else(|| NetSqliteError::disconnected(format!("connection to {} is closed", peer)))
    }
}
