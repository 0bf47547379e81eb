//! Resilient byte-stream link to the serial-to-Ethernet adapter.
//!
//! The RS-485 side is reached through a TCP tunnel that drops, stalls and
//! truncates without warning. This link keeps a single buffered connection,
//! reconnects with capped backoff, and exposes the read primitives the
//! protocol engine needs to recover frame alignment after noise: exact-length
//! reads, bounded best-effort reads, and a header hunt that discards junk in
//! front of a marker byte.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const DIAL_ATTEMPTS: u32 = 3;
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(3);

/// Per-pull read timeout inside the header hunt.
const HUNT_CHUNK_TIMEOUT: Duration = Duration::from_millis(500);

const READ_CHUNK_SIZE: usize = 2048;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {addr} failed after {attempts} attempts")]
    DialFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Default)]
struct Inner {
    stream: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    buf: BytesMut,
    connection_reset: bool,
}

/// A reconnecting, buffered TCP connection to the bus adapter.
///
/// All methods take `&self`; stream and read buffer live behind one mutex,
/// while connect/close hold a second, finer lock so two callers can never
/// race a dial against a dial or a close.
pub struct TransportLink {
    host: String,
    port: u16,
    inner: Mutex<Inner>,
    conn_lock: Mutex<()>,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl TransportLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            inner: Mutex::new(Inner::default()),
            conn_lock: Mutex::new(()),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Keepalive tuning is advisory; the link works without it.
    fn enable_keepalive(stream: &TcpStream) {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!(%err, "tcp keepalive not enabled");
        }
    }

    /// Ensure the link is dialed. No-op when already connected; otherwise up
    /// to three attempts with increasing backoff, surfacing the last error.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.inner.lock().await.stream.is_some() {
            return Ok(());
        }

        let _guard = self.conn_lock.lock().await;
        let mut inner = self.inner.lock().await;
        if inner.stream.is_some() {
            return Ok(());
        }

        info!(addr = %self.addr(), "connecting to bus adapter");

        let mut last_err = io::Error::new(io::ErrorKind::Other, "no dial attempted");
        for attempt in 1..=DIAL_ATTEMPTS {
            let dial = TcpStream::connect((self.host.as_str(), self.port));
            match timeout(DIAL_TIMEOUT, dial).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    Self::enable_keepalive(&stream);
                    inner.stream = Some(stream.into_split());
                    inner.connection_reset = false;
                    info!(addr = %self.addr(), "connected");
                    return Ok(());
                }
                Ok(Err(err)) => last_err = err,
                Err(_) => {
                    last_err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
                }
            }
            warn!(addr = %self.addr(), attempt, %last_err, "connect attempt failed");
            if attempt < DIAL_ATTEMPTS {
                sleep(Duration::from_secs(u64::from(attempt)).min(MAX_DIAL_BACKOFF)).await;
            }
        }

        Err(TransportError::DialFailed {
            addr: self.addr(),
            attempts: DIAL_ATTEMPTS,
            source: last_err,
        })
    }

    /// Best-effort graceful shutdown; always clears the stream and read
    /// buffer. Idempotent.
    pub async fn close(&self) {
        let _guard = self.conn_lock.lock().await;
        let mut inner = self.inner.lock().await;
        if let Some((_, mut writer)) = inner.stream.take() {
            let _ = writer.shutdown().await;
        }
        inner.buf.clear();
        inner.connection_reset = false;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.stream.is_some()
    }

    async fn try_write(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        let (_, writer) = inner
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link not open"))?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Write one chunk, reconnecting and retrying exactly once if the socket
    /// broke underneath us.
    pub async fn write_chunk(&self, data: &[u8]) -> bool {
        if let Err(err) = self.connect().await {
            warn!(%err, "write: connect failed");
            return false;
        }

        debug!("writing {} bytes: {:02x?}", data.len(), data);
        match self.try_write(data).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "socket write error, reconnecting");
                self.close().await;
                if let Err(err) = self.connect().await {
                    warn!(%err, "reconnect after write error failed");
                    return false;
                }
                match self.try_write(data).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%err, "write failed again after reconnect");
                        false
                    }
                }
            }
        }
    }

    /// Read exactly `length` bytes, buffering as needed.
    ///
    /// Returns empty on timeout (buffered bytes are kept for the next read)
    /// and short when the peer closes; a short result is a failed read for
    /// every caller. On peer close the link is torn down so the next caller
    /// starts from a fresh dial.
    pub async fn read_exact(&self, length: usize, overall: Duration) -> Bytes {
        if self.connect().await.is_err() {
            return Bytes::new();
        }

        let deadline = Instant::now() + overall;
        let mut reset = false;
        let data = {
            let mut inner = self.inner.lock().await;
            loop {
                if inner.buf.len() >= length {
                    break inner.buf.split_to(length).freeze();
                }
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Bytes::new();
                };
                let Some((reader, _)) = inner.stream.as_mut() else {
                    return Bytes::new();
                };
                let mut chunk = [0u8; READ_CHUNK_SIZE];
                let res = timeout(remaining, reader.read(&mut chunk)).await;
                match res {
                    Ok(Ok(0)) => {
                        inner.connection_reset = true;
                        reset = true;
                        let short = inner.buf.len().min(length);
                        break inner.buf.split_to(short).freeze();
                    }
                    Ok(Ok(n)) => inner.buf.extend_from_slice(&chunk[..n]),
                    Ok(Err(err)) => {
                        warn!(%err, "socket read error");
                        inner.connection_reset = true;
                        reset = true;
                        break Bytes::new();
                    }
                    Err(_) => return Bytes::new(),
                }
            }
        };

        if reset {
            warn!("read detected closed socket, resetting link");
            self.close().await;
        }
        data
    }

    /// One bounded read of up to `max_length` bytes; empty on timeout.
    ///
    /// Never tears the link down: the polling read path expects short
    /// silences and must not turn each one into a reconnect storm. Buffered
    /// bytes are served before the socket is touched.
    pub async fn read_best_effort(&self, max_length: usize, overall: Duration) -> Bytes {
        if self.connect().await.is_err() {
            return Bytes::new();
        }

        let mut inner = self.inner.lock().await;
        if !inner.buf.is_empty() {
            let n = inner.buf.len().min(max_length);
            return inner.buf.split_to(n).freeze();
        }
        let Some((reader, _)) = inner.stream.as_mut() else {
            return Bytes::new();
        };
        let mut chunk = vec![0u8; max_length.max(1)];
        let res = timeout(overall, reader.read(&mut chunk)).await;
        match res {
            Ok(Ok(0)) => {
                inner.connection_reset = true;
                Bytes::new()
            }
            Ok(Ok(n)) => Bytes::copy_from_slice(&chunk[..n]),
            Ok(Err(err)) => {
                warn!(%err, "best-effort read error");
                Bytes::new()
            }
            Err(_) => Bytes::new(),
        }
    }

    /// Scan the incoming stream for `header`, discarding whatever precedes
    /// it. Returns true with the buffer aligned on the header, false when
    /// `overall` elapses or the peer closes.
    ///
    /// A single-byte header that is absent from the buffer means the whole
    /// buffer is noise; a multi-byte header might span two reads, so the
    /// last `len - 1` bytes are retained across pulls.
    pub async fn hunt_for_header(&self, header: &[u8], overall: Duration) -> bool {
        if header.is_empty() || self.connect().await.is_err() {
            return false;
        }

        let deadline = Instant::now() + overall;
        let mut inner = self.inner.lock().await;
        loop {
            if !inner.buf.is_empty() {
                if let Some(idx) = find_subsequence(&inner.buf, header) {
                    if idx > 0 {
                        warn!(
                            "header hunt: discarding {} noise bytes: {:02x?}",
                            idx,
                            &inner.buf[..idx]
                        );
                        inner.buf.advance(idx);
                    }
                    return true;
                }
                if header.len() == 1 {
                    inner.buf.clear();
                } else {
                    let keep = header.len() - 1;
                    if inner.buf.len() > keep {
                        let at = inner.buf.len() - keep;
                        inner.buf.advance(at);
                    }
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let Some((reader, _)) = inner.stream.as_mut() else {
                return false;
            };
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let res = timeout(HUNT_CHUNK_TIMEOUT.min(remaining), reader.read(&mut chunk)).await;
            match res {
                Ok(Ok(0)) => {
                    inner.connection_reset = true;
                    return false;
                }
                Ok(Ok(n)) => inner.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => {
                    warn!(%err, "header hunt read error");
                    return false;
                }
                Err(_) => continue,
            }
        }

        if inner.buf.is_empty() {
            warn!("header hunt timed out, buffer empty");
        } else {
            warn!(
                "header hunt timed out, dumping {} buffered bytes: {:02x?}",
                inner.buf.len(),
                &inner.buf[..]
            );
        }
        false
    }

    /// Push bytes back to the front of the read buffer. The engine uses this
    /// to resume scanning one byte past a false header match.
    pub async fn unread(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let mut buf = BytesMut::with_capacity(data.len() + inner.buf.len());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&inner.buf);
        inner.buf = buf;
    }
}
