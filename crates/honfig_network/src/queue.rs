//! Bounded per-instance packet queues with a drop-oldest overflow policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use honfig_protocol::GamePacket;

/// Depth of each per-instance packet queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Creates a bounded packet queue. The sender evicts the oldest queued
/// packet instead of blocking when the queue is full, so a stalled consumer
/// can never wedge the listener.
pub fn packet_queue(depth: usize) -> (PacketSender, flume::Receiver<GamePacket>) {
    let (tx, rx) = flume::bounded(depth);
    let sender = PacketSender {
        tx,
        rx: rx.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// Sending half of a per-instance packet queue.
#[derive(Clone)]
pub struct PacketSender {
    tx: flume::Sender<GamePacket>,
    // Kept to evict from the head on overflow.
    rx: flume::Receiver<GamePacket>,
    dropped: Arc<AtomicU64>,
}

impl PacketSender {
    /// Enqueues a packet, evicting the oldest queued packet when full.
    pub fn push(&self, pkt: GamePacket) {
        while self.tx.is_full() {
            if self.rx.try_recv().is_ok() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }

        if self.tx.try_send(pkt).is_err() {
            // Receiver is gone; the instance is being torn down.
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of packets evicted or discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use honfig_protocol::game::{LongFrame, ServerAnnounce};

    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let (tx, rx) = packet_queue(4);

        for port in 0..6_u32 {
            tx.push(ServerAnnounce { port }.into());
        }

        assert_eq!(tx.len(), 4);
        assert_eq!(tx.dropped(), 2);

        // The two oldest packets were evicted.
        let first = rx.try_recv().unwrap();
        assert_eq!(first, ServerAnnounce { port: 2 }.into());
    }

    #[test]
    fn flood_never_exceeds_depth() {
        let (tx, _rx) = packet_queue(DEFAULT_QUEUE_DEPTH);

        for _ in 0..1000 {
            tx.push(LongFrame { skipped_ms: 1 }.into());
            assert!(tx.len() <= DEFAULT_QUEUE_DEPTH);
        }

        assert_eq!(tx.len(), DEFAULT_QUEUE_DEPTH);
        assert_eq!(tx.dropped(), 1000 - DEFAULT_QUEUE_DEPTH as u64);
    }
}
