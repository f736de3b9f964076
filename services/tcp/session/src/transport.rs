//! Buffered TCP/TLS transport for sessions.
//!
//! [`IoStream`] unifies plain and TLS sockets. [`SmartStream`] wraps one in
//! independently locked read and write halves, adds line reading with a
//! length limit, tracks activity and byte counters, and upgrades a plain
//! socket to TLS in place without closing it.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::{Result, SessionError};

/// Size of the read buffer in front of every session socket
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// How long a graceful shutdown may take before the socket is just dropped
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Server side of a TLS stream
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client side of a TLS stream
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// True once a TLS layer is active
    pub fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            IoStream::Plain(stream) => stream,
            IoStream::Tls(stream) => stream.get_ref().0,
            IoStream::TlsClient(stream) => stream.get_ref().0,
        }
    }
}

/// Line terminator accepted by [`SmartStream::read_line`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineTermination {
    /// Only `\r\n` ends a line; a bare `\n` is line content
    #[default]
    CrLf,
    /// `\n` ends a line; one preceding `\r` is stripped
    LfTolerant,
}

/// What to do with a line longer than the configured maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineOverflow {
    /// Keep the first `max_len` bytes and discard the rest of the line
    Truncate,
    /// Discard the whole line and fail with [`SessionError::LineTooLong`]
    #[default]
    Fail,
}

/// Wall-clock time of the last read or write.
///
/// Stored as epoch milliseconds and only ever moved forward.
#[derive(Debug)]
pub struct ActivityClock(AtomicI64);

impl ActivityClock {
    /// Start the clock at "now"
    pub fn new() -> Self {
        Self(AtomicI64::new(Utc::now().timestamp_millis()))
    }

    /// Record activity at the current time
    pub fn touch(&self) {
        self.0.fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    /// Time of the last recorded activity
    pub fn last(&self) -> DateTime<Utc> {
        let millis = self.0.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    /// How long ago the last activity happened
    pub fn idle_for(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.0.load(Ordering::Acquire);
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

type Reader = BufReader<ReadHalf<IoStream>>;
type Writer = WriteHalf<IoStream>;

/// Buffered session stream with line reading and in-place TLS upgrade
pub struct SmartStream {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    activity: ActivityClock,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    secure: AtomicBool,
    closed: watch::Sender<bool>,
    io_timeout: Option<Duration>,
}

impl SmartStream {
    /// Wrap a connected stream. `io_timeout` bounds every read and write.
    pub fn new(stream: IoStream, io_timeout: Option<Duration>) -> Self {
        let secure = stream.is_tls();
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Some(BufReader::with_capacity(READ_BUFFER_SIZE, reader))),
            writer: Mutex::new(Some(writer)),
            activity: ActivityClock::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            secure: AtomicBool::new(secure),
            closed,
            io_timeout,
        }
    }

    /// Activity clock shared with the owning session
    pub fn activity(&self) -> &ActivityClock {
        &self.activity
    }

    /// Total bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// True once TLS is active
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    /// True after [`SmartStream::close`]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Read one line, without its terminator.
    ///
    /// Returns `Ok(None)` on EOF before any byte of a new line. A line cut
    /// short by EOF is returned as-is.
    pub async fn read_line(
        &self,
        termination: LineTermination,
        max_len: usize,
        overflow: LineOverflow,
    ) -> Result<Option<String>> {
        if max_len == 0 {
            return Err(SessionError::InvalidArgument("max_len must be positive".into()));
        }
        self.guarded(async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(SessionError::Disposed)?;
            let mut acc = LineAccumulator::new(termination, max_len);

            loop {
                let available = reader.fill_buf().await?;
                if available.is_empty() {
                    if acc.is_empty() {
                        return Ok(None);
                    }
                    acc.finish_at_eof();
                    break;
                }
                let consumed = acc.feed(available);
                reader.consume(consumed);
                self.bytes_read.fetch_add(consumed as u64, Ordering::Relaxed);
                self.activity.touch();
                if acc.done {
                    break;
                }
            }

            if acc.overflowed && overflow == LineOverflow::Fail {
                return Err(SessionError::LineTooLong { limit: max_len });
            }
            Ok(Some(String::from_utf8_lossy(&acc.line).into_owned()))
        })
        .await
    }

    /// Read whatever is available, up to `buf.len()` bytes. 0 means EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.guarded(async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(SessionError::Disposed)?;
            let n = reader.read(buf).await?;
            self.record_read(n);
            Ok(n)
        })
        .await
    }

    /// Fill `buf` completely
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.guarded(async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(SessionError::Disposed)?;
            reader.read_exact(buf).await?;
            self.record_read(buf.len());
            Ok(())
        })
        .await
    }

    /// Write all of `data` and flush
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        self.guarded(async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(SessionError::Disposed)?;
            writer.write_all(data).await?;
            writer.flush().await?;
            self.record_write(data.len() as u64);
            Ok(())
        })
        .await
    }

    /// Copy from `source` to the peer and flush.
    ///
    /// With `count`, exactly that many bytes are copied and a short source
    /// is an `UnexpectedEof` error; without it the source is drained.
    pub async fn write_from<R>(&self, source: &mut R, count: Option<u64>) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.guarded(async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(SessionError::Disposed)?;
            let copied = match count {
                Some(limit) => {
                    let mut limited = (&mut *source).take(limit);
                    let copied = tokio::io::copy(&mut limited, &mut *writer).await?;
                    if copied < limit {
                        self.record_write(copied);
                        return Err(SessionError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("source ended after {} of {} bytes", copied, limit),
                        )));
                    }
                    copied
                }
                None => tokio::io::copy(source, &mut *writer).await?,
            };
            writer.flush().await?;
            self.record_write(copied);
            Ok(copied)
        })
        .await
    }

    /// Flush buffered writes
    pub async fn flush(&self) -> Result<()> {
        self.guarded(async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(SessionError::Disposed)?;
            writer.flush().await?;
            Ok(())
        })
        .await
    }

    /// Run the server side of a TLS handshake on the same socket
    pub async fn upgrade_to_server_tls(&self, acceptor: TlsAcceptor) -> Result<()> {
        self.upgrade(|tcp| async move { acceptor.accept(tcp).await.map(IoStream::Tls) })
            .await
    }

    /// Run the client side of a TLS handshake on the same socket
    pub async fn upgrade_to_client_tls(
        &self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        self.upgrade(|tcp| async move {
            connector
                .connect(server_name, tcp)
                .await
                .map(IoStream::TlsClient)
        })
        .await
    }

    async fn upgrade<F, Fut>(&self, handshake: F) -> Result<()>
    where
        F: FnOnce(TcpStream) -> Fut,
        Fut: Future<Output = std::io::Result<IoStream>>,
    {
        if self.is_secure() {
            return Err(SessionError::AlreadySecure);
        }
        if self.is_closed() {
            return Err(SessionError::Disconnected);
        }

        // Lock order is always reader, then writer.
        let mut reader_slot = self.reader.lock().await;
        let mut writer_slot = self.writer.lock().await;

        if reader_slot.as_ref().is_some_and(|r| !r.buffer().is_empty()) {
            return Err(SessionError::InvalidState(
                "unread plaintext is buffered; refusing tls upgrade",
            ));
        }
        let (reader, writer) = match (reader_slot.take(), writer_slot.take()) {
            (Some(r), Some(w)) => (r, w),
            _ => return Err(SessionError::Disposed),
        };

        let tcp = match reader.into_inner().unsplit(writer) {
            IoStream::Plain(tcp) => tcp,
            tls => {
                let (r, w) = tokio::io::split(tls);
                *reader_slot = Some(BufReader::with_capacity(READ_BUFFER_SIZE, r));
                *writer_slot = Some(w);
                return Err(SessionError::AlreadySecure);
            }
        };

        // A failed handshake consumes the socket; the session is unusable afterwards.
        let upgraded = match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake(tcp))
                .await
                .map_err(|_| SessionError::Timeout(limit))?,
            None => handshake(tcp).await,
        }
        .map_err(|e| SessionError::Tls(e.to_string()))?;

        let (r, w) = tokio::io::split(upgraded);
        *reader_slot = Some(BufReader::with_capacity(READ_BUFFER_SIZE, r));
        *writer_slot = Some(w);
        self.secure.store(true, Ordering::Release);
        self.activity.touch();
        debug!("transport upgraded to tls");
        Ok(())
    }

    /// Close the stream.
    ///
    /// Pending and future operations fail with [`SessionError::Disconnected`].
    /// The write side is shut down gracefully (TLS close_notify included)
    /// before both halves are dropped. Idempotent.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
        }
        self.reader.lock().await.take();
    }

    fn record_read(&self, n: usize) {
        if n > 0 {
            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            self.activity.touch();
        }
    }

    fn record_write(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
        self.activity.touch();
    }

    /// Run an I/O operation under the timeout, racing the close signal
    async fn guarded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(SessionError::Disconnected);
        }
        let timed = async {
            match self.io_timeout {
                Some(limit) => tokio::time::timeout(limit, op)
                    .await
                    .map_err(|_| SessionError::Timeout(limit))?,
                None => op.await,
            }
        };
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(SessionError::Disconnected),
            result = timed => result,
        }
    }
}

impl std::fmt::Debug for SmartStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartStream")
            .field("secure", &self.is_secure())
            .field("closed", &self.is_closed())
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

/// Incremental line assembly across buffer refills
struct LineAccumulator {
    termination: LineTermination,
    max_len: usize,
    line: Vec<u8>,
    pending_cr: bool,
    overflowed: bool,
    seen: bool,
    done: bool,
}

impl LineAccumulator {
    fn new(termination: LineTermination, max_len: usize) -> Self {
        Self {
            termination,
            max_len,
            line: Vec::new(),
            pending_cr: false,
            overflowed: false,
            seen: false,
            done: false,
        }
    }

    fn is_empty(&self) -> bool {
        !self.seen
    }

    /// Consume bytes up to and including the terminator; returns bytes used
    fn feed(&mut self, chunk: &[u8]) -> usize {
        let mut used = 0;
        for &b in chunk {
            used += 1;
            self.seen = true;
            match b {
                b'\n' if self.pending_cr => {
                    self.pending_cr = false;
                    self.done = true;
                    break;
                }
                b'\n' if self.termination == LineTermination::LfTolerant => {
                    self.done = true;
                    break;
                }
                b'\r' => {
                    if self.pending_cr {
                        self.push(b'\r');
                    }
                    self.pending_cr = true;
                }
                _ => {
                    if self.pending_cr {
                        self.pending_cr = false;
                        self.push(b'\r');
                    }
                    self.push(b);
                }
            }
        }
        used
    }

    fn finish_at_eof(&mut self) {
        if self.pending_cr {
            self.pending_cr = false;
            self.push(b'\r');
        }
        self.done = true;
    }

    fn push(&mut self, b: u8) {
        if self.line.len() < self.max_len {
            self.line.push(b);
        } else {
            self.overflowed = true;
        }
    }
}
