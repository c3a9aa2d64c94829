//! Length-prefixed binary framing over a byte pipe.
//!
//! Each logical message is one bincode-serialized object behind a fixed
//! 8-byte header: `[magic u16][version u8][reserved u8][payload len u32 BE]`.
//! Binary blobs ride inside the payload natively, with no base64 hop.
//!
//! A payload that fails to deserialize is reported as a recoverable
//! [`PreforkError::Decode`]: the reader has already consumed the declared
//! payload length, so the stream stays aligned and the next read continues
//! with the following frame. Header corruption is fatal.

use crate::error::{PreforkError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufReader, BufWriter, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic, "PF" in big-endian.
pub const FRAME_MAGIC: u16 = 0x5046;

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Maximum accepted payload size. Bounds the damage of a corrupted
/// length word (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Buffer size for the blocking reader/writer (64 KiB).
const BUFFER_SIZE: usize = 64 * 1024;

fn encode_header(payload_len: usize) -> Result<[u8; HEADER_LEN]> {
    if payload_len > MAX_FRAME_LEN {
        return Err(PreforkError::Decode(format!(
            "frame payload of {} bytes exceeds the {} byte limit",
            payload_len, MAX_FRAME_LEN
        )));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
    header[2] = FRAME_VERSION;
    header[3] = 0;
    header[4..8].copy_from_slice(&(payload_len as u32).to_be_bytes());
    Ok(header)
}

/// Validate a header and return the payload length.
///
/// Header corruption means the stream position can no longer be trusted,
/// so it surfaces as a fatal `InvalidData` IO error rather than a
/// recoverable decode error.
fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    let magic = u16::from_be_bytes([header[0], header[1]]);
    if magic != FRAME_MAGIC {
        return Err(PreforkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad frame magic 0x{:04x}", magic),
        )));
    }
    if header[2] != FRAME_VERSION {
        return Err(PreforkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported frame version {}", header[2]),
        )));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PreforkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} exceeds the {} byte limit", len, MAX_FRAME_LEN),
        )));
    }
    Ok(len)
}

/// Blocking frame writer (child side).
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, inner),
        }
    }

    /// Serialize `msg` and write it as a single frame, then flush.
    pub fn write<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        let header = encode_header(payload.len())?;
        self.writer.write_all(&header)?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flush any buffered bytes to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Blocking frame reader (child side).
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, inner),
        }
    }

    /// Read the next frame. Returns `Ok(None)` on clean EOF between frames.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut header = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = decode_header(&header)?;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        match bincode::deserialize(&payload) {
            Ok(msg) => Ok(Some(msg)),
            // Payload fully consumed, so the stream is still frame-aligned.
            Err(e) => Err(PreforkError::Decode(e.to_string())),
        }
    }
}

/// Async frame writer (parent side, over a child's stdin).
pub struct AsyncFrameWriter<W: AsyncWrite + Unpin> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> AsyncFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        let header = encode_header(payload.len())?;
        self.inner.write_all(&header).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut the stream down, signalling EOF to the peer.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Async frame reader (parent side, over a child's stdout).
///
/// `read` uses `read_exact`, which is not cancel-safe: run the read loop
/// in a dedicated task and hand frames over a channel rather than putting
/// this directly inside a `select!`.
pub struct AsyncFrameReader<R: AsyncRead + Unpin> {
    inner: R,
}

impl<R: AsyncRead + Unpin> AsyncFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame. Returns `Ok(None)` on clean EOF between frames.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut header = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = decode_header(&header)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        match bincode::deserialize(&payload) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => Err(PreforkError::Decode(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        id: String,
        blob: Vec<u8>,
        count: u64,
    }

    fn sample() -> TestMsg {
        TestMsg {
            id: "req-1".into(),
            blob: vec![0x00, 0xff, 0x7f, 0x80, 0x0a],
            count: 42,
        }
    }

    #[test]
    fn roundtrip_preserves_binary_blobs() {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write(&sample()).unwrap();
        writer.write(&sample()).unwrap();
        drop(writer);

        let mut reader = FrameReader::new(Cursor::new(buf));
        let first: TestMsg = reader.read().unwrap().unwrap();
        let second: TestMsg = reader.read().unwrap().unwrap();
        assert_eq!(first, sample());
        assert_eq!(second, sample());
        assert!(reader.read::<TestMsg>().unwrap().is_none());
    }

    #[test]
    fn decode_error_keeps_stream_aligned() {
        // A frame whose payload is garbage, followed by a valid frame.
        let garbage = [0xde, 0xad, 0xbe, 0xef];
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(garbage.len()).unwrap());
        buf.extend_from_slice(&garbage);
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write(&sample()).unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buf));
        match reader.read::<TestMsg>() {
            Err(PreforkError::Decode(_)) => {}
            other => panic!("expected decode error, got {:?}", other.map(|_| ())),
        }
        // Next frame is still readable.
        let msg: TestMsg = reader.read().unwrap().unwrap();
        assert_eq!(msg, sample());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 0x12;
        buf[1] = 0x34;
        let mut reader = FrameReader::new(Cursor::new(buf));
        match reader.read::<TestMsg>() {
            Err(PreforkError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::InvalidData);
            }
            other => panic!("expected fatal IO error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write(&sample()).unwrap();
        }
        buf.truncate(buf.len() - 2);
        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(reader.read::<TestMsg>().is_err());
    }

    #[test]
    fn oversized_length_word_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        header[2] = FRAME_VERSION;
        header[4..8].copy_from_slice(&(u32::MAX).to_be_bytes());
        assert!(decode_header(&header).is_err());
    }

    #[tokio::test]
    async fn async_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = AsyncFrameWriter::new(client);
        let mut reader = AsyncFrameReader::new(server);

        writer.write(&sample()).await.unwrap();
        let msg: TestMsg = reader.read().await.unwrap().unwrap();
        assert_eq!(msg, sample());

        writer.close().await.unwrap();
        assert!(reader.read::<TestMsg>().await.unwrap().is_none());
    }
}
