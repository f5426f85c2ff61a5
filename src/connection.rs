use crate::error::{Result, RotelError};
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, FramedRead};

/// Byte terminating every status line sent by the device
pub const STATUS_TERMINATOR: u8 = b'$';

/// Default upper bound for an unterminated status line
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Decodes `$`-terminated status lines
///
/// Whitespace-only lines are skipped. If the unterminated remainder grows
/// past the limit the buffer is dropped and [`RotelError::Framing`] is
/// returned; lines completed before that point are still yielded first.
#[derive(Debug, Clone)]
pub struct StatusCodec {
    max_len: usize,
    /// Bytes already searched for a terminator
    next_index: usize,
}

impl StatusCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, next_index: 0 }
    }
}

impl Decoder for StatusCodec {
    type Item = String;
    type Error = RotelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|&b| b == STATUS_TERMINATOR) else {
                if src.len() > self.max_len {
                    let buffered = src.len();
                    src.clear();
                    self.next_index = 0;
                    return Err(RotelError::Framing {
                        buffered,
                        limit: self.max_len,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let pos = self.next_index + offset;
            self.next_index = 0;
            let frame = src.split_to(pos + 1);
            let line = String::from_utf8_lossy(&frame[..pos]).trim().to_string();
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if !src.is_empty() {
            tracing::debug!(bytes = src.len(), "Discarding unterminated data at EOF");
            src.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

/// Read half of a connection, yielding complete status lines
pub struct LineReader {
    frames: FramedRead<BoxedReader, StatusCodec>,
}

impl LineReader {
    fn new(reader: BoxedReader, max_line_len: usize) -> Self {
        Self {
            frames: FramedRead::new(reader, StatusCodec::new(max_line_len)),
        }
    }

    /// Wait for the next complete line
    ///
    /// Returns `Ok(None)` once the peer closed the connection. Cancel safe:
    /// dropping the future never loses buffered data.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.frames.next().await.transpose()
    }
}

/// Write half of a connection
///
/// Cloneable; clones share the socket and writes are serialized.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl LineWriter {
    fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Write one command as-is; the protocol uses no line feeds
    ///
    /// A failed write closes the writer, so later sends fail as well.
    pub async fn send(&self, command: &str) -> Result<()> {
        if command.contains(['\r', '\n']) {
            return Err(RotelError::InvalidArgument(format!("command {command:?} contains line endings")));
        }

        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| RotelError::Write("connection closed".to_string()))?;

        tracing::debug!(command, "Sending");
        let result = match writer.write_all(command.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            *guard = None;
            return Err(RotelError::Write(e.to_string()));
        }
        Ok(())
    }

    /// Shut the write side down; idempotent
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "Error shutting down writer");
            }
        }
    }
}

/// A framed connection to the amplifier
pub struct Connection {
    writer: LineWriter,
    reader: LineReader,
}

impl Connection {
    /// Open a TCP connection
    ///
    /// Timeouts, refused connections and resolution failures are all
    /// reported as [`RotelError::Connect`].
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration, max_line_len: usize) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        tracing::info!("Connecting to {}", addr);

        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RotelError::Connect(format!("{addr}: {e}"))),
            Err(_) => {
                return Err(RotelError::Connect(format!(
                    "{addr}: timed out after {}ms",
                    connect_timeout.as_millis()
                )))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Self::from_stream(stream, max_line_len))
    }

    /// Wrap an already-established byte stream
    pub fn from_stream<S>(stream: S, max_line_len: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            writer: LineWriter::new(Box::new(write)),
            reader: LineReader::new(Box::new(read), max_line_len),
        }
    }

    /// Separate the write and read halves
    pub fn split(self) -> (LineWriter, LineReader) {
        (self.writer, self.reader)
    }
}

/// Opens connections for a session
///
/// The TCP implementation is [`TcpConnector`]; tests plug in in-memory streams.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
        max_line_len: usize,
    ) -> BoxFuture<'a, Result<Connection>>;
}

/// Connects over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
        max_line_len: usize,
    ) -> BoxFuture<'a, Result<Connection>> {
        Connection::connect(host, port, timeout, max_line_len).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn decode_all(codec: &mut StatusCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn codec_splits_concatenated_lines() {
        let mut codec = StatusCodec::new(64);
        let mut buf = BytesMut::from(&b"power=on$volume=45$mute=off$"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["power=on", "volume=45", "mute=off"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_carries_partial_data() {
        let mut codec = StatusCodec::new(64);
        let mut buf = BytesMut::from(&b"pwr_on$vol_"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["pwr_on"]);
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(b"42$");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["vol_42"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_skips_empty_lines() {
        let mut codec = StatusCodec::new(64);
        let mut buf = BytesMut::from(&b"$$ $cd$"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["cd"]);
    }

    #[test]
    fn codec_rejects_oversized_unterminated_data() {
        let mut codec = StatusCodec::new(8);
        let mut buf = BytesMut::from(&b"abcdefghijk"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, RotelError::Framing { buffered: 11, limit: 8 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_yields_complete_line_before_framing_error() {
        let mut codec = StatusCodec::new(64);
        let mut buf = BytesMut::from(&b"mute=on$"[..]);
        buf.extend_from_slice(&[b'x'; 200]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("mute=on"));
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, RotelError::Framing { buffered: 200, limit: 64 }));
    }

    #[test]
    fn codec_accepts_long_terminated_lines() {
        let mut codec = StatusCodec::new(4);
        let mut buf = BytesMut::from(&b"volume=45$"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["volume=45"]);
    }

    #[test]
    fn codec_drops_unterminated_tail_at_eof() {
        let mut codec = StatusCodec::new(64);
        let mut buf = BytesMut::from(&b"cd$vol_4"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("cd"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn reader_yields_same_lines_across_read_boundaries() {
        let (client, mut device) = duplex(256);
        let (_writer, mut reader) = Connection::from_stream(client, 64).split();

        device.write_all(b"pwr_on$vol_").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("pwr_on"));

        device.write_all(b"42$").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("vol_42"));
    }

    #[tokio::test]
    async fn reader_ends_when_peer_closes() {
        let (client, mut device) = duplex(256);
        let (_writer, mut reader) = Connection::from_stream(client, 64).split();

        device.write_all(b"power=on$mute=on$").await.unwrap();
        drop(device);

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("power=on"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("mute=on"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reader_keeps_line_read_together_with_oversized_data() {
        let (client, mut device) = duplex(1024);
        let (_writer, mut reader) = Connection::from_stream(client, 64).split();

        let mut data = b"mute=on$".to_vec();
        data.extend_from_slice(&[b'x'; 200]);
        device.write_all(&data).await.unwrap();

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("mute=on"));
        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err, RotelError::Framing { limit: 64, .. }));
    }

    #[tokio::test]
    async fn send_writes_command_without_line_feed() {
        let (client, mut device) = duplex(256);
        let (writer, _reader) = Connection::from_stream(client, 64).split();

        writer.send("vol_42!").await.unwrap();
        writer.send("cd!").await.unwrap();

        let mut buf = [0u8; 10];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"vol_42!cd!");
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (client, _device) = duplex(256);
        let (writer, _reader) = Connection::from_stream(client, 64).split();
        let other = writer.clone();

        writer.close().await;
        let err = other.send("power_on!").await.unwrap_err();
        assert!(matches!(err, RotelError::Write(_)));
    }

    #[tokio::test]
    async fn send_rejects_line_endings() {
        let (client, _device) = duplex(256);
        let (writer, _reader) = Connection::from_stream(client, 64).split();
        let err = writer.send("power_on!\r\n").await.unwrap_err();
        assert!(matches!(err, RotelError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn tcp_connect_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpConnector
            .connect("127.0.0.1", port, Duration::from_secs(1), 64)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RotelError::Connect(_)));
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"model?");
            socket.write_all(b"model=a14$").await.unwrap();
        });

        let (writer, mut reader) = Connection::connect("127.0.0.1", port, Duration::from_secs(1), 64)
            .await
            .unwrap()
            .split();
        writer.send("model?").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("model=a14"));
        device.await.unwrap();
    }
}
