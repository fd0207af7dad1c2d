//! Bounded queues carrying chunks between workers.
//!
//! Producers never wait. When a queue is full its oldest chunk is overwritten,
//! and the reader is told how many it missed.

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{trace, warn};

/// Default number of chunks an inbox holds before dropping the oldest.
pub const INBOX_CAPACITY: usize = 1024;

/// The producing side of a worker's inbox.
///
/// Cheap to clone; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct Inbox {
    tx: broadcast::Sender<Bytes>,
}

impl Inbox {
    /// A new, empty inbox holding up to `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        // The initial receiver is dropped, readers come from `reader()`.
        let (tx, _) = broadcast::channel(capacity.max(1));

        Self { tx }
    }

    /// Queue a chunk without waiting.
    ///
    /// Returns false if no reader currently exists, in which case the chunk is discarded.
    pub fn post(&self, chunk: Bytes) -> bool {
        match self.tx.send(chunk) {
            Ok(_) => true,
            Err(_) => {
                trace!("Inbox has no reader, chunk discarded");
                false
            }
        }
    }

    /// Start reading.
    ///
    /// Only chunks posted after this call are seen.
    /// There should be a single reader at a time.
    pub fn reader(&self) -> InboxReader {
        InboxReader {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Chunks queued and not yet read.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new(INBOX_CAPACITY)
    }
}

/// The consuming side of an inbox.
#[derive(Debug)]
pub struct InboxReader {
    rx: broadcast::Receiver<Bytes>,
    dropped: u64,
}

impl InboxReader {
    /// Wait for the next chunk.
    ///
    /// Returns `None` when every [`Inbox`] handle is gone.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(RecvError::Lagged(missed)) => self.note_lag(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next chunk if one is ready.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => return Some(chunk),
                Err(TryRecvError::Lagged(missed)) => self.note_lag(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Chunks lost to overflow since the last call.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    fn note_lag(&mut self, missed: u64) {
        warn!(missed, "Inbox overflowed, oldest chunks dropped");
        self.dropped += missed;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn delivers_in_order() {
        let inbox = Inbox::new(16);
        let mut reader = inbox.reader();

        for i in 0..10u8 {
            assert!(inbox.post(Bytes::from(vec![i])));
        }

        for i in 0..10u8 {
            assert_eq!(reader.recv().await, Some(Bytes::from(vec![i])));
        }
        assert_eq!(reader.take_dropped(), 0);
    }

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let inbox = Inbox::new(4);
        let mut reader = inbox.reader();

        for i in 0..10u8 {
            inbox.post(Bytes::from(vec![i]));
        }

        let mut received = vec![];
        while let Some(chunk) = reader.try_recv() {
            received.push(chunk[0]);
        }

        assert_eq!(received, vec![6, 7, 8, 9]);
        assert_eq!(reader.take_dropped(), 6);
        assert_eq!(reader.take_dropped(), 0);
    }

    #[tokio::test]
    async fn two_producers_one_reader() {
        let inbox = Inbox::new(16);
        let mut reader = inbox.reader();
        let other = inbox.clone();

        inbox.post(Bytes::from_static(b"a"));
        other.post(Bytes::from_static(b"b"));

        assert_eq!(reader.recv().await, Some(Bytes::from_static(b"a")));
        assert_eq!(reader.recv().await, Some(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn closed_when_producers_gone() {
        let inbox = Inbox::new(4);
        let mut reader = inbox.reader();

        inbox.post(Bytes::from_static(b"last"));
        drop(inbox);

        assert_eq!(reader.recv().await, Some(Bytes::from_static(b"last")));
        assert_eq!(reader.recv().await, None);
    }

    #[test]
    fn post_without_reader_is_discarded() {
        let inbox = Inbox::new(4);

        assert!(!inbox.post(Bytes::from_static(b"nobody")));
    }
}
