//! Link Connection
//!
//! One established stream to one peer. The read half is owned by a dedicated
//! reader task spawned by the supervisor. Outbound frames go through a bounded
//! queue drained by a writer task, so a peer that stops reading only ever
//! stalls its own link.

use log::debug;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use super::framing::write_frame;
use super::transport::BoxedStream;
use crate::types::LinkAddress;

/// Frames a link may hold waiting for its writer before it counts as stalled
pub const OUTBOUND_QUEUE_FRAMES: usize = 64;

/// Lifecycle of a link; `Closed` is terminal.
///
/// A link is `Connecting` from construction until the supervisor registers
/// it. Streams are handed over already open, so registered links start out
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Connecting,
    Connected,
    Closed,
}

pub struct LinkConnection {
    id: u64,
    address: LinkAddress,
    state: SyncMutex<LinkState>,
    outbound: mpsc::Sender<Vec<u8>>,
    reader_stop: Notify,
    writer_stop: Notify,
    established_at: Instant,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl LinkConnection {
    /// The returned receiver is the outbound queue; hand it to `write_loop`.
    pub(crate) fn new(id: u64, address: LinkAddress) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);

        let link = Self {
            id,
            address,
            state: SyncMutex::new(LinkState::Connecting),
            outbound,
            reader_stop: Notify::new(),
            writer_stop: Notify::new(),
            established_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        };
        (link, queue)
    }

    /// Registry generation; distinguishes a link from its successor at the same address
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    pub(crate) fn mark_connected(&self) {
        let mut state = self.state.lock();
        if *state == LinkState::Connecting {
            *state = LinkState::Connected;
        }
    }

    /// Move to `Closed` and wake the reader and writer. Returns true only for
    /// the caller that performed the transition, so teardown runs exactly once.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Closed {
                return false;
            }
            *state = LinkState::Closed;
        }

        // notify_one stores a permit if a task is not parked yet
        self.reader_stop.notify_one();
        self.writer_stop.notify_one();
        debug!("Link {} (#{}) closed", self.address, self.id);
        true
    }

    pub(crate) async fn closed(&self) {
        self.reader_stop.notified().await
    }

    /// Queue one frame without waiting. A full queue means the peer has
    /// stopped draining the link and is reported as `WouldBlock`.
    pub fn enqueue(&self, payload: Vec<u8>) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }

        match self.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("outbound queue full ({} frames)", OUTBOUND_QUEUE_FRAMES),
            )),
            Err(TrySendError::Closed(_)) => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "writer stopped"))
            }
        }
    }

    /// Drain the outbound queue into the write half until the link closes or
    /// a write fails, then half-close our side so the peer's reader sees EOF.
    pub(crate) async fn write_loop(
        &self,
        mut writer: WriteHalf<BoxedStream>,
        mut queue: mpsc::Receiver<Vec<u8>>,
    ) -> io::Result<()> {
        let result = tokio::select! {
            _ = self.writer_stop.notified() => Ok(()),
            result = async {
                while let Some(payload) = queue.recv().await {
                    write_frame(&mut writer, &payload).await?;
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok::<(), io::Error>(())
            } => result,
        };

        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} write half: {}", self.address, e);
        }
        result
    }

    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "address": self.address,
            "id": self.id,
            "state": self.state(),
            "connected_secs": self.established_at.elapsed().as_secs(),
            "frames_sent": self.frames_sent.load(Ordering::Relaxed),
            "frames_received": self.frames_received.load(Ordering::Relaxed),
            "frames_queued": OUTBOUND_QUEUE_FRAMES - self.outbound.capacity(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::framing::read_frame;
    use std::sync::Arc;
    use std::time::Duration;

    fn link_pair() -> (Arc<LinkConnection>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let boxed: BoxedStream = Box::new(ours);
        let (_read, write) = tokio::io::split(boxed);
        let (link, queue) = LinkConnection::new(7, LinkAddress::from("AA:BB"));
        let link = Arc::new(link);

        let writer = link.clone();
        tokio::spawn(async move { writer.write_loop(write, queue).await });
        (link, theirs)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (link, _peer) = link_pair();
        assert_eq!(link.state(), LinkState::Connecting);

        link.mark_connected();
        assert_eq!(link.state(), LinkState::Connected);

        assert!(link.close());
        assert!(!link.close(), "second close must not repeat teardown");
        assert_eq!(link.state(), LinkState::Closed);

        link.mark_connected();
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_queued_frames_reach_peer_and_close_sends_eof() {
        let (link, mut peer) = link_pair();
        link.mark_connected();

        link.enqueue(b"HELLO|dev1".to_vec()).unwrap();
        assert_eq!(read_frame(&mut peer, 64).await.unwrap().unwrap(), b"HELLO|dev1");

        link.close();
        let err = link.enqueue(b"late".to_vec()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let eof = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut peer, 64))
            .await
            .unwrap();
        assert!(matches!(eof, Ok(None)));
    }

    #[tokio::test]
    async fn test_full_queue_is_reported_without_waiting() {
        let (link, _peer) = link_pair();
        link.mark_connected();

        // Nothing reads the peer side, so the pipe fills and then the queue.
        let frame = vec![b'x'; 512];
        let mut result = Ok(());
        for _ in 0..(OUTBOUND_QUEUE_FRAMES + 64) {
            result = link.enqueue(frame.clone());
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_close_before_wait_is_not_lost() {
        let (link, _peer) = link_pair();
        link.close();
        tokio::time::timeout(Duration::from_secs(1), link.closed())
            .await
            .expect("closed() should return after close()");
    }
}
