//! Length-delimited framing: `[u32 big-endian length][length bytes]`.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the length prefix in bytes.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Default upper bound on a single frame's declared length (1 GiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

const READ_CHUNK: usize = 64 * 1024;

/// Prefix `content` with its length.
pub fn encode_frame(content: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(content.len()).map_err(|_| Error::FrameTooLarge {
        len: content.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + content.len());
    buf.put_u32(len);
    buf.put_slice(content);
    Ok(buf.freeze())
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, content: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(content)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive buffer turning arbitrarily split reads into whole frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append `bytes` and take every frame that is now complete.
    ///
    /// An empty result only means the next frame has not fully arrived yet.
    /// Frames completed ahead of an oversized one are returned first; the
    /// oversized length stays buffered and fails the following call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        self.extend(bytes);
        let mut frames = Vec::new();
        loop {
            match self.try_next() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(err) if frames.is_empty() => return Err(err),
                Err(_) => return Ok(frames),
            }
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete frame, or leave the buffer untouched.
    pub fn try_next(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < LENGTH_FIELD_LEN + len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_FIELD_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes held that do not yet form a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Reads whole frames from one side of a connection.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    chunk: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::new(max_frame_len),
            chunk: vec![0; READ_CHUNK],
        }
    }

    /// Next frame, or `None` once the peer closed cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.buffer.try_next()? {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.buffered() == 0 {
                    return Ok(None);
                }
                return Err(Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "connection closed with {} bytes of an unfinished frame",
                        self.buffer.buffered()
                    ),
                )));
            }
            tracing::trace!(bytes = n, buffered = self.buffer.buffered(), "read");
            self.buffer.extend(&self.chunk[..n]);
        }
    }

    /// Lazily yield frames until the connection closes or fails.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.read_frame().await?.map(|frame| (frame, reader)))
        })
    }
}
