use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

pub use redis_protocol::resp2::types::BytesFrame as Frame;

/// Inline requests are single lines; anything longer than this without a
/// newline is a desynchronized or hostile stream.
const MAX_INLINE_LEN: usize = 64 * 1024;

/// A RESP2 framed byte stream.
///
/// Decoding is incremental: frames may arrive split across reads, and the
/// buffer carries partial frames between calls. Generic over the transport
/// so tests can drive it with `tokio::io::duplex`.
#[derive(Debug)]
pub struct RespConn<S> {
    stream: S,
    buf: BytesMut,
}

enum InlineStep {
    Request((Frame, Bytes)),
    EmptyLine,
    NeedMore,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RespConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read one RESP frame, together with its raw encoded bytes for
    /// zero-copy forwarding. `Ok(None)` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<(Frame, Bytes)>> {
        loop {
            if let Some(decoded) = self.try_decode()? {
                return Ok(Some(decoded));
            }
            if !self.fill().await? {
                return self.eof();
            }
        }
    }

    /// Read one client request. Like [`read_frame`], but a line that does
    /// not start a RESP array is parsed as an inline command and surfaced
    /// re-encoded as an array, so the rest of the proxy sees one shape.
    ///
    /// [`read_frame`]: RespConn::read_frame
    pub async fn read_request(&mut self) -> Result<Option<(Frame, Bytes)>> {
        loop {
            match self.buf.first().copied() {
                Some(b'*') => {
                    if let Some(decoded) = self.try_decode()? {
                        return Ok(Some(decoded));
                    }
                }
                Some(_) => match self.take_inline_line()? {
                    InlineStep::Request(req) => return Ok(Some(req)),
                    InlineStep::EmptyLine => continue,
                    InlineStep::NeedMore => {}
                },
                None => {}
            }
            if !self.fill().await? {
                return self.eof();
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<(Frame, Bytes)>> {
        match redis_protocol::resp2::decode::decode_bytes_mut(&mut self.buf) {
            Ok(Some((frame, _amt, raw))) => Ok(Some((frame, raw))),
            Ok(None) => Ok(None),
            Err(e) => Err(ProxyError::Protocol(e.to_string())),
        }
    }

    fn take_inline_line(&mut self) -> Result<InlineStep> {
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_INLINE_LEN {
                return Err(ProxyError::Protocol("too big inline request".into()));
            }
            return Ok(InlineStep::NeedMore);
        };

        let line = self.buf.split_to(end + 1);
        let line = &line[..line.len() - 1];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let parts: Vec<Bytes> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|p| !p.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();

        // Redis ignores empty inline lines.
        if parts.is_empty() {
            return Ok(InlineStep::EmptyLine);
        }

        let raw = encode_command(&parts).freeze();
        let frame = Frame::Array(parts.into_iter().map(Frame::BulkString).collect());
        Ok(InlineStep::Request((frame, raw)))
    }

    async fn fill(&mut self) -> Result<bool> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        Ok(n > 0)
    }

    fn eof(&mut self) -> Result<Option<(Frame, Bytes)>> {
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Err(ProxyError::Protocol("unexpected end of stream".into()))
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_simple(&mut self, s: &str) -> Result<()> {
        self.write_all(format!("+{s}\r\n").as_bytes()).await
    }

    /// Write a RESP error reply. `msg` carries the error code prefix,
    /// e.g. `"ERR backend unavailable"`.
    pub async fn write_error(&mut self, msg: &str) -> Result<()> {
        self.write_all(format!("-{msg}\r\n").as_bytes()).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Encode a command as a RESP array of bulk strings, the request shape
/// Redis expects.
pub fn encode_command(parts: &[Bytes]) -> BytesMut {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for p in parts {
        out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
        out.extend_from_slice(p);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Convenience wrapper for ASCII command parts.
pub fn encode_command_str(parts: &[&str]) -> BytesMut {
    let parts: Vec<Bytes> = parts
        .iter()
        .map(|s| Bytes::copy_from_slice(s.as_bytes()))
        .collect();
    encode_command(&parts)
}

pub fn is_error_frame(frame: &Frame) -> bool {
    matches!(frame, Frame::Error(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn conn_with(chunks: &[&[u8]]) -> RespConn<tokio::io::DuplexStream> {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        for c in chunks {
            tx.write_all(c).await.unwrap();
        }
        drop(tx);
        RespConn::new(rx)
    }

    fn array_parts(frame: &Frame) -> Vec<Bytes> {
        let Frame::Array(items) = frame else {
            panic!("expected array, got {frame:?}");
        };
        items
            .iter()
            .map(|f| match f {
                Frame::BulkString(b) => b.clone(),
                other => panic!("expected bulk string, got {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn decodes_array_request() {
        let mut conn = conn_with(&[b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n"]).await;
        let (frame, raw) = conn.read_request().await.unwrap().unwrap();
        assert_eq!(array_parts(&frame), vec![&b"GET"[..], &b"a"[..]]);
        assert_eq!(&raw[..], b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    }

    #[tokio::test]
    async fn resumes_frame_split_across_reads() {
        let mut conn = conn_with(&[b"*1\r\n$4\r\nPI", b"NG\r\n"]).await;
        let (frame, _) = conn.read_request().await.unwrap().unwrap();
        assert_eq!(array_parts(&frame), vec![&b"PING"[..]]);
        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parses_inline_command() {
        let mut conn = conn_with(&[b"SET key value\r\n"]).await;
        let (frame, raw) = conn.read_request().await.unwrap().unwrap();
        assert_eq!(
            array_parts(&frame),
            vec![&b"SET"[..], &b"key"[..], &b"value"[..]]
        );
        // Inline requests are re-encoded so forwarding stays zero-copy.
        assert_eq!(&raw[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }

    #[tokio::test]
    async fn skips_empty_inline_lines() {
        let mut conn = conn_with(&[b"\r\n  \r\nPING\n"]).await;
        let (frame, _) = conn.read_request().await.unwrap().unwrap();
        assert_eq!(array_parts(&frame), vec![&b"PING"[..]]);
    }

    #[tokio::test]
    async fn command_round_trips_through_codec() {
        let parts: Vec<Bytes> = [&b"LPUSH"[..], b"queue", b"\x00binary\xff"]
            .iter()
            .map(|p| Bytes::copy_from_slice(p))
            .collect();
        let encoded = encode_command(&parts);

        let mut conn = conn_with(&[&encoded[..]]).await;
        let (frame, _) = conn.read_frame().await.unwrap().unwrap();
        assert_eq!(array_parts(&frame), parts);
    }

    #[tokio::test]
    async fn malformed_frame_is_protocol_error() {
        let mut conn = conn_with(&[b"*notalength\r\n"]).await;
        let err = conn.read_request().await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_stream_is_protocol_error() {
        let mut conn = conn_with(&[b"*2\r\n$3\r\nGET\r\n$1"]).await;
        let err = conn.read_request().await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }
}
