//! Byte relay between the TCP stream and the protocol engine
//!
//! The engine reads and writes one end of a local socket pair. The client
//! owns the other end through a [`Relay`] and copies bytes between it and the
//! TCP stream. Every byte crossing the relay is counted, which is where the
//! session's traffic figures come from.

use bytes::{Bytes, BytesMut};
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Size of a single relay read
pub const RELAY_CHUNK: usize = 16 * 1024;

/// Queued bytes in one direction above which the relay stops taking more
pub const RELAY_HIGH_WATER: usize = 256 * 1024;

/// Bytes sent and received since the last sample
#[derive(Debug, Default)]
pub struct TrafficCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounters {
    /// Create zeroed counters
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count bytes written towards the server
    pub fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count bytes read from the server
    pub fn add_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Current `(sent, received)` without resetting
    pub fn peek(&self) -> (u64, u64) {
        (self.sent.load(Ordering::Relaxed), self.received.load(Ordering::Relaxed))
    }

    /// Return `(sent, received)` and reset both to zero
    pub fn take(&self) -> (u64, u64) {
        (self.sent.swap(0, Ordering::Relaxed), self.received.swap(0, Ordering::Relaxed))
    }
}

/// Something the relay did on the engine's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Queued server bytes were written to the engine's socket
    Delivered(usize),
    /// Bytes the engine wants sent to the server
    Outgoing(Bytes),
    /// The engine closed its end of the pair
    EngineClosed,
}

/// Client side of the engine's socket pair
///
/// Server bytes are queued with [`Relay::queue_inbound`] and written to the
/// engine as it drains its socket, so a slow engine never stalls the caller.
#[derive(Debug)]
pub struct Relay {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    inbound: BytesMut,
    outbound: BytesMut,
    counters: Arc<TrafficCounters>,
}

impl Relay {
    /// Create a relay and the engine's end of the pair
    ///
    /// The engine end is switched to non-blocking mode so engine calls return
    /// "would block" instead of stalling the client task.
    pub fn pair(counters: Arc<TrafficCounters>) -> io::Result<(Self, StdUnixStream)> {
        let (ours, engine) = StdUnixStream::pair()?;
        ours.set_nonblocking(true)?;
        engine.set_nonblocking(true)?;

        let (reader, writer) = UnixStream::from_std(ours)?.into_split();
        let relay = Self {
            reader,
            writer,
            inbound: BytesMut::new(),
            outbound: BytesMut::with_capacity(RELAY_CHUNK),
            counters,
        };
        Ok((relay, engine))
    }

    /// Queue bytes received from the server for the engine
    pub fn queue_inbound(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Server bytes not yet taken by the engine
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Whether enough server bytes are queued that reading more should wait
    pub fn is_backlogged(&self) -> bool {
        self.inbound.len() >= RELAY_HIGH_WATER
    }

    /// Wait for the next transfer in either direction
    ///
    /// Writes queued server bytes to the engine whenever there are any, and
    /// reads engine output only while `accept_outgoing` is set. Pends forever
    /// when neither applies. Safe to cancel: nothing is lost if the future is
    /// dropped before it completes.
    pub async fn next_event(&mut self, accept_outgoing: bool) -> io::Result<RelayEvent> {
        let flushing = !self.inbound.is_empty();
        if accept_outgoing {
            self.outbound.reserve(RELAY_CHUNK);
        }

        tokio::select! {
            written = self.writer.write_buf(&mut self.inbound), if flushing => {
                let n = written?;
                self.counters.add_received(n);
                Ok(RelayEvent::Delivered(n))
            }
            read = self.reader.read_buf(&mut self.outbound), if accept_outgoing => {
                let n = read?;
                if n == 0 {
                    return Ok(RelayEvent::EngineClosed);
                }
                self.counters.add_sent(n);
                Ok(RelayEvent::Outgoing(self.outbound.split().freeze()))
            }
            else => std::future::pending().await,
        }
    }

    /// Shared traffic counters
    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    #[test]
    fn test_counters_take_resets() {
        let counters = TrafficCounters::new();
        counters.add_sent(10);
        counters.add_received(32);
        counters.add_sent(5);

        assert_eq!(counters.peek(), (15, 32));
        assert_eq!(counters.take(), (15, 32));
        assert_eq!(counters.take(), (0, 0));
    }

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let counters = TrafficCounters::new();
        let (mut relay, mut engine) = Relay::pair(counters.clone()).unwrap();

        relay.queue_inbound(b"SSH-2.0-server\r\n");
        assert_eq!(relay.next_event(false).await.unwrap(), RelayEvent::Delivered(16));
        assert_eq!(relay.pending_inbound(), 0);

        let mut inbound = [0u8; 64];
        let n = engine.read(&mut inbound).unwrap();
        assert_eq!(&inbound[..n], b"SSH-2.0-server\r\n");

        engine.write_all(b"SSH-2.0-client\r\n").unwrap();
        let out = relay.next_event(true).await.unwrap();
        assert_eq!(out, RelayEvent::Outgoing(Bytes::from_static(b"SSH-2.0-client\r\n")));

        assert_eq!(counters.take(), (16, 16));
    }

    #[tokio::test]
    async fn test_reports_engine_close() {
        let (mut relay, engine) = Relay::pair(TrafficCounters::new()).unwrap();
        drop(engine);

        assert_eq!(relay.next_event(true).await.unwrap(), RelayEvent::EngineClosed);
    }

    #[tokio::test]
    async fn test_idle_relay_pends() {
        let (mut relay, mut engine) = Relay::pair(TrafficCounters::new()).unwrap();
        engine.write_all(b"unread").unwrap();

        // Engine output is held back while outgoing is not accepted
        let waited = tokio::time::timeout(Duration::from_millis(20), relay.next_event(false)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_backlog_when_engine_stops_reading() {
        let counters = TrafficCounters::new();
        let (mut relay, _engine) = Relay::pair(counters.clone()).unwrap();

        relay.queue_inbound(&vec![0u8; RELAY_HIGH_WATER * 4]);
        assert!(relay.is_backlogged());

        // Drain until the socket pair is full and writes stop completing
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(50), relay.next_event(false)).await
        {
            assert!(matches!(event.unwrap(), RelayEvent::Delivered(_)));
        }

        let (_, received) = counters.peek();
        assert_eq!(received as usize + relay.pending_inbound(), RELAY_HIGH_WATER * 4);
        assert!(relay.is_backlogged());
    }
}
