use std::io::{self, ErrorKind};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::network::MessageFrame;
use crate::AppResult;

/// Inbound half of one transport connection.
///
/// Owns the read half of the socket and a read buffer, and decodes the byte
/// stream into discrete message payloads. The write half lives in the
/// [`ConnectionHandle`](crate::network::ConnectionHandle) so sends can happen
/// from any task while this side sits in a blocking read loop.
#[derive(Debug)]
pub struct Connection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Connection {
    pub fn new(reader: OwnedReadHalf, buffer_size: usize, max_frame_size: usize) -> Connection {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            max_frame_size,
        }
    }

    /// Reads the next message payload from the connection.
    ///
    /// Returns `Ok(Some(payload))` for each complete message, `Ok(None)` when
    /// the peer closes the connection gracefully, and an error when the peer
    /// drops mid-frame, the frame is malformed, or the read itself fails.
    pub async fn read_message(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            if let Some(frame) = MessageFrame::parse(&mut self.buffer, self.max_frame_size)? {
                return Ok(Some(frame.payload));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}
