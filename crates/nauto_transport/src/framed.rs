use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

pub const SENTINEL: &[u8] = b"]]>]]>";

/// Framing mode negotiated once per session (spec.md §4.1/§4.3). Never
/// re-negotiated mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Sentinel,
    Chunked,
}

impl FrameMode {
    /// Chunked iff both peers advertised base:1.1 (spec.md §4.3 edge rule).
    pub fn negotiate(local_base_1_1: bool, peer_base_1_1: bool) -> FrameMode {
        if local_base_1_1 && peer_base_1_1 {
            FrameMode::Chunked
        } else {
            FrameMode::Sentinel
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads length-delimited or sentinel-delimited frames off an
/// [`AsyncRead`] stream. Keeps a carry-over buffer so that frame
/// reassembly is correct regardless of how the underlying stream slices
/// bytes across individual `poll_read` calls (spec.md §8 property 3).
pub struct FramedReader<R> {
    inner: R,
    mode: FrameMode,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, mode: FrameMode) -> Self {
        FramedReader {
            inner,
            mode,
            pending: Vec::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Switches framing mode once capabilities are exchanged (spec.md
    /// §4.3's "iff both sides advertise base-1.1" rule). Only ever
    /// called once per session, after the peer's `<hello>` is read.
    pub fn set_mode(&mut self, mode: FrameMode) {
        self.mode = mode;
    }

    async fn fill_more(&mut self) -> Result<(), TransportError> {
        let mut buf = [0u8; 4096];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::EofMidFrame);
        }
        self.pending.extend_from_slice(&buf[..n]);
        Ok(())
    }

    async fn ensure(&mut self, n: usize) -> Result<(), TransportError> {
        while self.pending.len() < n {
            self.fill_more().await?;
        }
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.mode {
            FrameMode::Sentinel => self.read_sentinel_frame().await,
            FrameMode::Chunked => self.read_chunked_frame().await,
        }
    }

    async fn read_sentinel_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(pos) = find_subslice(&self.pending, SENTINEL) {
                let frame = self.pending[..pos].to_vec();
                self.pending.drain(..pos + SENTINEL.len());
                return Ok(frame);
            }
            self.fill_more().await?;
        }
    }

    /// Parses `\n#<len>\n<len bytes>` chunks until a terminating
    /// `\n##\n` is seen, concatenating chunk bodies in order.
    async fn read_chunked_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut body = Vec::new();
        loop {
            self.ensure(2).await?;
            if &self.pending[0..2] != b"\n#" {
                return Err(TransportError::FramingInvalid);
            }
            let mut idx = 2;
            loop {
                if idx >= self.pending.len() {
                    self.fill_more().await?;
                    continue;
                }
                if self.pending[idx] == b'\n' {
                    break;
                }
                idx += 1;
            }
            let marker = self.pending[2..idx].to_vec();
            if marker == b"#" {
                self.pending.drain(..idx + 1);
                return Ok(body);
            }
            let len: usize = std::str::from_utf8(&marker)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(TransportError::FramingInvalid)?;
            self.pending.drain(..idx + 1);
            self.ensure(len).await?;
            body.extend_from_slice(&self.pending[..len]);
            self.pending.drain(..len);
        }
    }
}

/// Writes length-delimited or sentinel-delimited frames to an
/// [`AsyncWrite`] stream.
pub struct FramedWriter<W> {
    inner: W,
    mode: FrameMode,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W, mode: FrameMode) -> Self {
        FramedWriter { inner, mode }
    }

    pub fn set_mode(&mut self, mode: FrameMode) {
        self.mode = mode;
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self.mode {
            FrameMode::Sentinel => {
                self.inner.write_all(data).await?;
                self.inner.write_all(SENTINEL).await?;
            }
            FrameMode::Chunked => {
                let header = format!("\n#{}\n", data.len());
                self.inner.write_all(header.as_bytes()).await?;
                self.inner.write_all(data).await?;
                self.inner.write_all(b"\n##\n").await?;
            }
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    #[tokio::test]
    async fn sentinel_round_trip() {
        let (client, server) = duplex(4096);
        let mut writer = FramedWriter::new(client, FrameMode::Sentinel);
        let mut reader = FramedReader::new(server, FrameMode::Sentinel);

        writer.write_frame(b"<hello/>").await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame, b"<hello/>");
    }

    #[tokio::test]
    async fn chunked_round_trip() {
        let (client, server) = duplex(4096);
        let mut writer = FramedWriter::new(client, FrameMode::Chunked);
        let mut reader = FramedReader::new(server, FrameMode::Chunked);

        writer.write_frame(b"<rpc-reply/>").await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame, b"<rpc-reply/>");
    }

    /// Property: frame reassembly is correct no matter how the byte
    /// stream is sliced (spec.md §8 property 3). Feed one byte at a time
    /// through a reader backed by a plain `Cursor`.
    #[tokio::test]
    async fn sentinel_reassembly_byte_at_a_time() {
        let raw = b"<a/><b/>]]>]]>".to_vec();
        let mut reader = FramedReader::new(OneByteAtATime::new(raw), FrameMode::Sentinel);
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame, b"<a/><b/>");
    }

    #[tokio::test]
    async fn chunked_reassembly_byte_at_a_time() {
        let raw = b"\n#4\nabcd\n#2\nef\n##\n".to_vec();
        let mut reader = FramedReader::new(OneByteAtATime::new(raw), FrameMode::Chunked);
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame, b"abcdef");
    }

    #[tokio::test]
    async fn malformed_chunk_header_is_framing_invalid() {
        let raw = b"not-a-chunk-header\n".to_vec();
        let mut reader = FramedReader::new(OneByteAtATime::new(raw), FrameMode::Chunked);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::FramingInvalid));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_reported() {
        let raw = b"<partial".to_vec();
        let mut reader = FramedReader::new(OneByteAtATime::new(raw), FrameMode::Sentinel);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::EofMidFrame));
    }

    /// An `AsyncRead` that yields at most one byte per poll, regardless
    /// of the caller's buffer size, to stress partial-read handling.
    struct OneByteAtATime {
        cursor: Cursor<Vec<u8>>,
    }

    impl OneByteAtATime {
        fn new(data: Vec<u8>) -> Self {
            OneByteAtATime {
                cursor: Cursor::new(data),
            }
        }
    }

    impl AsyncRead for OneByteAtATime {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let mut one = [0u8; 1];
            use std::io::Read;
            let n = self.cursor.read(&mut one)?;
            if n == 1 {
                buf.put_slice(&one);
            }
            std::task::Poll::Ready(Ok(()))
        }
    }
}
