// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client connection handling for the Master server.

use rendez::master::protocol::{check_frame_len, decode_body, encode_frame, ProtocolError};
use rendez::master::{ClientFrame, ServerFrame};
use rendez::ClientId;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Writing side of a connected node process.
///
/// Reads happen on a separate [`FrameReader`] so the connection task can
/// wait on its socket and its notification queue at the same time without
/// losing a partially read frame.
pub struct ClientConnection {
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    max_message_size: usize,
    client_id: Option<ClientId>,
}

/// Reading side of a connection.
pub struct FrameReader {
    reader: OwnedReadHalf,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl ClientConnection {
    /// Split `stream` into its writing and reading halves.
    pub fn split(stream: TcpStream, peer_addr: SocketAddr, max_message_size: usize) -> (Self, FrameReader) {
        let (reader, writer) = stream.into_split();
        (
            Self {
                writer,
                peer_addr,
                max_message_size,
                client_id: None,
            },
            FrameReader {
                reader,
                max_message_size,
                read_buffer: Vec::with_capacity(4096),
            },
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Client id allocated on this connection, once `RegisterClient` ran.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn set_client_id(&mut self, client_id: ClientId) {
        self.client_id = Some(client_id);
    }

    /// Send one frame to the client.
    pub async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), ConnectionError> {
        let bytes = encode_frame(frame, self.max_message_size)?;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        Ok(())
    }
}

impl FrameReader {
    /// Read one frame from the client.
    ///
    /// Returns `Ok(None)` if the connection is closed gracefully.
    pub async fn read_frame(&mut self) -> Result<Option<ClientFrame>, ConnectionError> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(ConnectionError::Io(e.to_string())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        check_frame_len(len, self.max_message_size)?;

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.reader
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        Ok(Some(decode_body(&self.read_buffer)?))
    }
}

/// Connection error types.
#[derive(Debug)]
pub enum ConnectionError {
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "Protocol error: {}", s),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(s) => Self::Io(s),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
