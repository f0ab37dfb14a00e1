//! Keep-alive enforcement for inbound HTTP/2 connections.
//!
//! tonic exposes no server-side ping policy, so each accepted connection is
//! wrapped in [`KeepaliveEnforced`], which watches the HTTP/2 frame headers
//! flowing in both directions:
//!
//! - an inbound PING arriving sooner than `min_time` after the previous one
//!   is a strike (two hours when no stream is active and pings without
//!   streams are not permitted)
//! - more than `max_ping_strikes` strikes aborts the connection
//! - the server sending HEADERS or DATA resets the strike count at the next
//!   PING
//!
//! The first PING on a connection never strikes.
//!
//! The wrapper also carries the connection's [`CloseSignal`]: once the host
//! closes its connections, every read and write fails and the connection
//! task ends.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tonic::transport::server::Connected;
use tracing::{debug, warn};

use super::shutdown::CloseSignal;

/// Client connection preface: "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
const CLIENT_PREFACE_LEN: usize = 24;
const FRAME_HEADER_LEN: usize = 9;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_PING: u8 = 0x6;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;

/// Ping interval tolerated from a client with no active stream when such
/// pings are not permitted
const IDLE_PING_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Server-side keep-alive enforcement thresholds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub min_time: Duration,
    pub permit_without_stream: bool,
    pub max_ping_strikes: u32,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            min_time: Duration::from_secs(2),
            permit_without_stream: true,
            max_ping_strikes: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            kind: bytes[3],
            flags: bytes[4],
            stream_id: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7fff_ffff,
        }
    }
}

/// Incremental HTTP/2 frame header scanner over one direction of a byte stream
#[derive(Debug)]
pub struct FrameScanner {
    preface_remaining: usize,
    header: [u8; FRAME_HEADER_LEN],
    header_len: usize,
    payload_remaining: usize,
}

impl FrameScanner {
    /// Scanner for client-to-server bytes, which start with the preface
    pub fn inbound() -> Self {
        Self::with_preface(CLIENT_PREFACE_LEN)
    }

    /// Scanner for server-to-client bytes
    pub fn outbound() -> Self {
        Self::with_preface(0)
    }

    fn with_preface(preface_remaining: usize) -> Self {
        Self {
            preface_remaining,
            header: [0; FRAME_HEADER_LEN],
            header_len: 0,
            payload_remaining: 0,
        }
    }

    /// Feed bytes, calling `on_frame` for every completed frame header
    pub fn feed(&mut self, mut data: &[u8], mut on_frame: impl FnMut(FrameHeader)) {
        while !data.is_empty() {
            if self.preface_remaining > 0 {
                let n = self.preface_remaining.min(data.len());
                self.preface_remaining -= n;
                data = &data[n..];
            } else if self.payload_remaining > 0 {
                let n = self.payload_remaining.min(data.len());
                self.payload_remaining -= n;
                data = &data[n..];
            } else {
                let n = (FRAME_HEADER_LEN - self.header_len).min(data.len());
                self.header[self.header_len..self.header_len + n].copy_from_slice(&data[..n]);
                self.header_len += n;
                data = &data[n..];
                if self.header_len == FRAME_HEADER_LEN {
                    let header = FrameHeader::parse(&self.header);
                    self.header_len = 0;
                    self.payload_remaining = header.length as usize;
                    on_frame(header);
                }
            }
        }
    }
}

/// Ping strike bookkeeping for one connection
#[derive(Debug)]
pub struct PingEnforcer {
    policy: KeepalivePolicy,
    last_ping: Option<Instant>,
    strikes: u32,
    reset_pending: bool,
    active_streams: HashSet<u32>,
}

impl PingEnforcer {
    pub fn new(policy: KeepalivePolicy) -> Self {
        Self {
            policy,
            last_ping: None,
            strikes: 0,
            reset_pending: false,
            active_streams: HashSet::new(),
        }
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.len()
    }

    /// Record a frame received from the client. Returns true when the
    /// connection must be closed.
    pub fn on_inbound(&mut self, frame: FrameHeader, now: Instant) -> bool {
        match frame.kind {
            FRAME_HEADERS if frame.stream_id != 0 => {
                self.active_streams.insert(frame.stream_id);
                false
            }
            FRAME_RST_STREAM => {
                self.active_streams.remove(&frame.stream_id);
                false
            }
            FRAME_PING if frame.flags & FLAG_ACK == 0 => self.on_ping(now),
            _ => false,
        }
    }

    /// Record a frame sent by the server
    pub fn on_outbound(&mut self, frame: FrameHeader) {
        match frame.kind {
            FRAME_HEADERS | FRAME_DATA => {
                self.reset_pending = true;
                if frame.flags & FLAG_END_STREAM != 0 {
                    self.active_streams.remove(&frame.stream_id);
                }
            }
            FRAME_RST_STREAM => {
                self.active_streams.remove(&frame.stream_id);
            }
            _ => {}
        }
    }

    fn on_ping(&mut self, now: Instant) -> bool {
        let last = self.last_ping.replace(now);

        if std::mem::take(&mut self.reset_pending) {
            self.strikes = 0;
            return false;
        }

        let threshold = if self.active_streams.is_empty() && !self.policy.permit_without_stream {
            IDLE_PING_INTERVAL
        } else {
            self.policy.min_time
        };
        if let Some(last) = last
            && now.duration_since(last) < threshold
        {
            self.strikes += 1;
        }

        self.strikes > self.policy.max_ping_strikes
    }
}

fn too_many_pings() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "too_many_pings")
}

fn closed_by_server() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

/// A connection whose inbound pings are policed by a [`PingEnforcer`]
pub struct KeepaliveEnforced<T> {
    inner: T,
    enforcer: PingEnforcer,
    inbound: FrameScanner,
    outbound: FrameScanner,
    aborted: bool,
    close: CloseSignal,
}

impl<T> KeepaliveEnforced<T> {
    pub fn new(inner: T, policy: KeepalivePolicy, close: CloseSignal) -> Self {
        Self {
            inner,
            enforcer: PingEnforcer::new(policy),
            inbound: FrameScanner::inbound(),
            outbound: FrameScanner::outbound(),
            aborted: false,
            close,
        }
    }

    /// Fails the connection once it was aborted or closed by the host
    fn check_open(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.aborted {
            return Err(too_many_pings());
        }
        if self.close.poll_closed(cx).is_ready() {
            debug!("Closing connection left open after drain");
            return Err(closed_by_server());
        }
        Ok(())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for KeepaliveEnforced<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Err(e) = this.check_open(cx) {
            return Poll::Ready(Err(e));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let now = Instant::now();
                let enforcer = &mut this.enforcer;
                let mut violated = false;
                this.inbound.feed(&buf.filled()[before..], |frame| {
                    violated |= enforcer.on_inbound(frame, now);
                });
                if violated {
                    this.aborted = true;
                    warn!(
                        strikes = this.enforcer.strikes(),
                        "Client pinged too often, closing connection: too_many_pings"
                    );
                    return Poll::Ready(Err(too_many_pings()));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for KeepaliveEnforced<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Err(e) = this.check_open(cx) {
            return Poll::Ready(Err(e));
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                let enforcer = &mut this.enforcer;
                this.outbound
                    .feed(&buf[..n], |frame| enforcer.on_outbound(frame));
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<T: Connected> Connected for KeepaliveEnforced<T> {
    type ConnectInfo = T::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}
