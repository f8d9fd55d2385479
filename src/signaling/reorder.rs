use super::SignalingMessage;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Per-stream reordering buffer.
///
/// The relay guarantees at-least-once delivery only, so one sender's
/// messages can arrive duplicated or out of order. This buffer releases
/// them in non-decreasing sequence order: duplicates and already
/// released sequence numbers are dropped, gaps are held back until the
/// missing predecessor arrives. A message is never released before its
/// predecessors unless the stash outgrows its limit, at which point the
/// gap is treated as relay loss and the stash drains in order.
#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: u64,
    stash: BTreeMap<u64, SignalingMessage>,
    limit: usize,
    duplicates_dropped: u64,
    gaps_surrendered: u64,
}

impl ReorderBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            next_expected: 1,
            stash: BTreeMap::new(),
            limit,
            duplicates_dropped: 0,
            gaps_surrendered: 0,
        }
    }

    /// Accept one arrival and return every message now releasable, in order
    pub fn accept(&mut self, msg: SignalingMessage) -> Vec<SignalingMessage> {
        if msg.seq < self.next_expected {
            self.duplicates_dropped += 1;
            debug!(
                session = %msg.session,
                seq = msg.seq,
                next_expected = self.next_expected,
                "Dropping duplicate or already released message"
            );
            return Vec::new();
        }

        if msg.seq > self.next_expected {
            // Out of order: stash, keyed by seq so a redelivered copy
            // overwrites rather than duplicates
            if self.stash.insert(msg.seq, msg).is_some() {
                self.duplicates_dropped += 1;
            }

            if self.stash.len() > self.limit {
                return self.surrender_gap();
            }
            return Vec::new();
        }

        // In order: release it plus any consecutive run from the stash
        let mut released = vec![msg];
        self.next_expected += 1;
        while let Some(stashed) = self.stash.remove(&self.next_expected) {
            released.push(stashed);
            self.next_expected += 1;
        }
        released
    }

    /// The stash outgrew its limit while waiting on a gap. The missing
    /// sequence numbers are considered lost; drain what we hold in
    /// order. Precondition for releasing past the gap: the relay log is
    /// durable and replayed on watch, so a number still absent after
    /// this many successors was never appended by the sender, not
    /// merely delayed in flight.
    fn surrender_gap(&mut self) -> Vec<SignalingMessage> {
        self.gaps_surrendered += 1;
        let released: Vec<SignalingMessage> =
            std::mem::take(&mut self.stash).into_values().collect();

        if let Some(last) = released.last() {
            warn!(
                session = %last.session,
                waiting_for = self.next_expected,
                released = released.len(),
                "Reorder stash overflow, surrendering gap"
            );
            self.next_expected = last.seq + 1;
        }
        released
    }

    /// Number of messages currently held back by a gap
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Role, SessionId};

    fn msg(seq: u64) -> SignalingMessage {
        SignalingMessage::candidate(
            SessionId::from("ab12cd34ef56"),
            Role::Viewer,
            seq,
            1,
            format!("candidate-{}", seq),
        )
    }

    fn seqs(released: &[SignalingMessage]) -> Vec<u64> {
        released.iter().map(|m| m.seq).collect()
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buf = ReorderBuffer::new(8);

        assert_eq!(seqs(&buf.accept(msg(1))), vec![1]);
        assert_eq!(seqs(&buf.accept(msg(2))), vec![2]);
        assert_eq!(buf.stashed(), 0);
    }

    #[test]
    fn test_out_of_order_buffered_then_released() {
        let mut buf = ReorderBuffer::new(8);

        // 3 and 2 arrive before 1; nothing is applied early
        assert!(buf.accept(msg(3)).is_empty());
        assert!(buf.accept(msg(2)).is_empty());
        assert_eq!(buf.stashed(), 2);

        // 1 arrives and the whole run releases in order
        assert_eq!(seqs(&buf.accept(msg(1))), vec![1, 2, 3]);
        assert_eq!(buf.stashed(), 0);
        assert_eq!(buf.next_expected(), 4);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut buf = ReorderBuffer::new(8);

        buf.accept(msg(1));
        assert!(buf.accept(msg(1)).is_empty());
        assert_eq!(buf.duplicates_dropped(), 1);

        // Duplicate of a stashed message collapses too
        buf.accept(msg(3));
        buf.accept(msg(3));
        assert_eq!(buf.duplicates_dropped(), 2);
        assert_eq!(buf.stashed(), 1);
    }

    #[test]
    fn test_released_sequence_non_decreasing() {
        let mut buf = ReorderBuffer::new(8);
        let arrivals = [5u64, 1, 3, 2, 2, 4, 1, 6];

        let mut observed = Vec::new();
        for seq in arrivals {
            observed.extend(seqs(&buf.accept(msg(seq))));
        }

        assert_eq!(observed, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_gap_surrender_on_overflow() {
        let mut buf = ReorderBuffer::new(3);

        // seq 1 never arrives; stash fills past the limit
        assert!(buf.accept(msg(2)).is_empty());
        assert!(buf.accept(msg(3)).is_empty());
        assert!(buf.accept(msg(4)).is_empty());
        let released = buf.accept(msg(5));

        // Drained in order despite the lost predecessor
        assert_eq!(seqs(&released), vec![2, 3, 4, 5]);
        assert_eq!(buf.next_expected(), 6);

        // A late seq 1 is now a duplicate-range drop
        assert!(buf.accept(msg(1)).is_empty());
    }
}
