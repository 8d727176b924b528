use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// One discrete application-level message on the wire: a 4-byte big-endian
/// length prefix followed by an opaque payload. The payload encoding belongs
/// entirely to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub payload: Bytes,
}

impl MessageFrame {
    pub fn new(payload: Bytes) -> Self {
        MessageFrame { payload }
    }

    pub fn check(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<()> {
        if buffer.remaining() < 4 {
            return Err(Incomplete);
        }
        let bytes_slice = buffer.get(0..4).unwrap();
        let payload_size = i32::from_be_bytes(bytes_slice.try_into().unwrap());
        if payload_size < 0 {
            return Err(AppError::MalformedFrame(format!(
                "frame size {} less than 0",
                payload_size
            )));
        }
        if payload_size as usize > max_frame_size {
            return Err(AppError::MalformedFrame(format!(
                "frame of length {} is too large",
                payload_size
            )));
        }
        if buffer.remaining() < payload_size as usize + 4 {
            buffer.reserve(payload_size as usize + 4);
            return Err(Incomplete);
        }
        Ok(())
    }

    /// Parses one frame out of the read buffer. Returns `None` when the buffer
    /// does not yet hold a complete frame.
    pub fn parse(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<Option<MessageFrame>> {
        match MessageFrame::check(buffer, max_frame_size) {
            Ok(_) => {
                let payload_length = buffer.get_i32();
                let payload = buffer.split_to(payload_length as usize).freeze();
                Ok(Some(MessageFrame { payload }))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes the frame to `writer` without flushing.
    pub async fn write_to<W>(&self, writer: &mut W, max_frame_size: usize) -> AppResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.payload.len() > max_frame_size {
            return Err(AppError::MalformedFrame(format!(
                "frame of length {} is too large",
                self.payload.len()
            )));
        }
        writer.write_i32(self.payload.len() as i32).await?;
        writer.write_all(&self.payload).await?;
        Ok(())
    }

    /// Encodes the frame into a standalone buffer. Used by tests and by peers
    /// that assemble messages before handing them to a writer.
    pub fn encode(&self) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(4 + self.payload.len());
        buffer.put_i32(self.payload.len() as i32);
        buffer.put_slice(&self.payload);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn test_parse_incomplete_prefix() {
        let mut buffer = BytesMut::from(&[0u8, 0, 0][..]);
        let frame = MessageFrame::parse(&mut buffer, MAX).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn test_parse_incomplete_payload() {
        let mut buffer = MessageFrame::new(Bytes::from_static(b"hello")).encode();
        buffer.truncate(6);
        let frame = MessageFrame::parse(&mut buffer, MAX).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn test_parse_complete_frame_leaves_rest() {
        let mut buffer = MessageFrame::new(Bytes::from_static(b"hello")).encode();
        buffer.extend_from_slice(&MessageFrame::new(Bytes::from_static(b"world")).encode());

        let first = MessageFrame::parse(&mut buffer, MAX).unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"hello"));
        let second = MessageFrame::parse(&mut buffer, MAX).unwrap().unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"world"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_rejects_negative_length() {
        let mut buffer = BytesMut::new();
        buffer.put_i32(-1);
        let result = MessageFrame::parse(&mut buffer, MAX);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_frame() {
        let mut buffer = BytesMut::new();
        buffer.put_i32(MAX as i32 + 1);
        let result = MessageFrame::parse(&mut buffer, MAX);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_to_matches_encode() -> AppResult<()> {
        let frame = MessageFrame::new(Bytes::from_static(b"payload"));
        let mut sink = Vec::new();
        frame.write_to(&mut sink, MAX).await?;
        assert_eq!(sink, frame.encode().to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_to_rejects_oversized_payload() {
        let frame = MessageFrame::new(Bytes::from(vec![0u8; MAX + 1]));
        let mut sink = Vec::new();
        assert!(frame.write_to(&mut sink, MAX).await.is_err());
    }
}
