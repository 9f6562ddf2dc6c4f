//! MLLP framing for HL7v2 messages.
//!
//! MLLP wraps each message in a one-byte start block and a two-byte
//! trailer: `0x0B <payload> 0x1C 0x0D`. The payload itself is opaque and
//! must not contain the end-block byte. The protocol is synchronous: a
//! peer sends one message and waits for the framed ACK before sending the
//! next, so a reader never has to deal with more than one in-flight
//! message per connection.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Vertical-tab, marks the start of a message.
pub const START_BLOCK: u8 = 0x0b;
/// File-separator, marks the end of the payload.
pub const END_BLOCK: u8 = 0x1c;
/// Carriage return, must follow the end block.
pub const CARRIAGE_RETURN: u8 = 0x0d;

const READ_CHUNK: usize = 4 * 1024;

/// Errors surfaced while deframing an MLLP stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the stream. Clean when it happens between
    /// messages; either way the connection is done.
    #[error("connection closed")]
    Closed,

    /// The byte after the end block was not a carriage return. The
    /// offending byte is left in the reader's buffer so a later read can
    /// attempt to resynchronize.
    #[error("message ends with {found:#04x}, want 0x0d")]
    BadTrailer { found: u8 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Writes `payload` to `sink` wrapped in the MLLP start block, end block
/// and carriage return. Does not flush; that is the caller's job.
pub async fn write_message<W>(sink: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(&[START_BLOCK]).await?;
    sink.write_all(payload).await?;
    // Trailer goes out in a single write so the peer observes the end
    // block and carriage return in order on the same stream.
    sink.write_all(&[END_BLOCK, CARRIAGE_RETURN]).await?;
    Ok(())
}

/// Buffered reader that yields unwrapped MLLP payloads from a stream.
pub struct MllpReader<R> {
    source: R,
    buf: BytesMut,
}

impl<R> MllpReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Returns the payload of the next complete message, with the
    /// envelope bytes stripped.
    ///
    /// Bytes preceding the start block are dropped (and counted in the
    /// log); real deployments see stray carriage returns and line noise
    /// between frames. A bad trailer byte fails with
    /// [`FrameError::BadTrailer`] but stays buffered for the next call.
    pub async fn next(&mut self) -> Result<Bytes, FrameError> {
        // Skip to the start block.
        let mut dropped = 0usize;
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == START_BLOCK) {
                dropped += pos;
                self.buf.advance(pos + 1);
                break;
            }
            dropped += self.buf.len();
            self.buf.clear();
            self.fill().await?;
        }
        if dropped > 0 {
            tracing::info!("dropped {} bytes before start of message", dropped);
        }

        // Collect the payload up to the end block.
        let mut scanned = 0usize;
        let end = loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == END_BLOCK) {
                break scanned + pos;
            }
            scanned = self.buf.len();
            self.fill().await?;
        };
        let payload = self.buf.split_to(end).freeze();
        self.buf.advance(1); // end block

        // One more byte for the carriage return.
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let trailer = self.buf[0];
        if trailer != CARRIAGE_RETURN {
            // Leave the mismatched byte unread.
            return Err(FrameError::BadTrailer { found: trailer });
        }
        self.buf.advance(1);

        Ok(payload)
    }

    async fn fill(&mut self) -> Result<(), FrameError> {
        self.buf.reserve(READ_CHUNK);
        let n = self.source.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        Ok(())
    }
}

/// Reads a single message from `source`. Trailing bytes on the stream may
/// be consumed into the reader's buffer and are discarded with it.
pub async fn read_message<R>(source: R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    MllpReader::new(source).next().await
}
