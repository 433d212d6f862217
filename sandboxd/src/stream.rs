//! Stdout/stderr multiplexing frame codec.
//!
//! Frames are 8 bytes of header then payload:
//! `[streamType(1)][reserved(3)][size(4, big-endian)]`. Stream type 1 is
//! stdout, 2 is stderr; anything else is skipped by the de-multiplexer.
//! Both the daemon attach framing and bridged framings reuse this codec.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header length of one frame.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload; larger sizes mean a corrupt or
/// misframed stream.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const STDOUT_BYTE: u8 = 1;
const STDERR_BYTE: u8 = 2;

/// Which output stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Unknown stream type; discarded on read, never written.
    Other(u8),
}

impl StreamKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            STDOUT_BYTE => StreamKind::Stdout,
            STDERR_BYTE => StreamKind::Stderr,
            other => StreamKind::Other(other),
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            StreamKind::Stdout => STDOUT_BYTE,
            StreamKind::Stderr => STDERR_BYTE,
            StreamKind::Other(b) => *b,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Frame {
            kind: StreamKind::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Frame {
            kind: StreamKind::Stderr,
            payload: payload.into(),
        }
    }
}

/// Encode the 8-byte header for a frame.
pub fn encode_header(kind: StreamKind, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = kind.byte();
    header[4..8].copy_from_slice(&len.to_be_bytes());
    header
}

/// Write one frame: header then payload. Does not flush.
pub async fn write_frame<W>(writer: &mut W, kind: StreamKind, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(kind, payload.len() as u32);
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on clean end-of-stream (EOF on a header
/// boundary); `UnexpectedEof` when the stream ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut read = 0;
    while read < HEADER_LEN {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        read += n;
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the maximum", len),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame payload",
            )
        } else {
            e
        }
    })?;

    Ok(Some(Frame {
        kind: StreamKind::from_byte(header[0]),
        payload: Bytes::from(payload),
    }))
}

/// Accumulated stdout/stderr of one exec.
#[derive(Debug, Default)]
pub struct StdStreams {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl StdStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a payload to the matching buffer; unknown kinds are dropped.
    pub fn push(&mut self, kind: StreamKind, payload: &[u8]) {
        match kind {
            StreamKind::Stdout => self.stdout.extend_from_slice(payload),
            StreamKind::Stderr => self.stderr.extend_from_slice(payload),
            StreamKind::Other(_) => {}
        }
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// De-multiplex a framed stream until end-of-stream.
///
/// Frames consumed before an error remain in `sink`, so a truncated stream
/// yields the bytes read so far plus the error. A payload is only pushed
/// once it is complete; a partial payload is never written to either
/// buffer.
pub async fn demux<R>(reader: &mut R, sink: &mut StdStreams) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = read_frame(reader).await? {
        sink.push(frame.kind, &frame.payload);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = encode_header(StreamKind::from_byte(kind), payload.len() as u32).to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_write_then_read_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, StreamKind::Stdout, b"hello").await.unwrap();
        write_frame(&mut buf, StreamKind::Stderr, b"oops").await.unwrap();

        let mut cursor = buf.as_slice();
        let first = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, Frame::stdout(&b"hello"[..]));
        let second = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second, Frame::stderr(&b"oops"[..]));
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_demux_routes_by_stream_type() {
        let mut input = Vec::new();
        input.extend(framed(1, b"out1"));
        input.extend(framed(2, b"err1"));
        input.extend(framed(1, b"out2"));

        let mut sink = StdStreams::new();
        demux(&mut input.as_slice(), &mut sink).await.unwrap();
        assert_eq!(sink.stdout, b"out1out2");
        assert_eq!(sink.stderr, b"err1");
    }

    #[tokio::test]
    async fn test_demux_discards_unknown_stream_type() {
        let mut input = Vec::new();
        input.extend(framed(7, b"noise"));
        input.extend(framed(2, b"err"));

        let mut sink = StdStreams::new();
        demux(&mut input.as_slice(), &mut sink).await.unwrap();
        assert!(sink.stdout.is_empty());
        assert_eq!(sink.stderr, b"err");
    }

    #[tokio::test]
    async fn test_truncated_payload_keeps_prior_frames() {
        let mut input = Vec::new();
        input.extend(framed(1, b"complete"));
        // Header promises 10 bytes, only 3 follow.
        input.extend(encode_header(StreamKind::Stderr, 10));
        input.extend_from_slice(b"tru");

        let mut sink = StdStreams::new();
        let err = demux(&mut input.as_slice(), &mut sink).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // The complete frame survived; the partial one reached neither buffer.
        assert_eq!(sink.stdout, b"complete");
        assert!(sink.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let input = [1u8, 0, 0];
        let mut sink = StdStreams::new();
        let err = demux(&mut input.as_slice(), &mut sink).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_eof() {
        let mut sink = StdStreams::new();
        demux(&mut (&[] as &[u8]), &mut sink).await.unwrap();
        assert!(sink.stdout.is_empty() && sink.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut input = encode_header(StreamKind::Stdout, MAX_FRAME_LEN + 1).to_vec();
        input.extend_from_slice(b"x");
        let err = read_frame(&mut input.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
