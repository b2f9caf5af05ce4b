//! Ordered seq -> packet map backing the retransmit and reassembly queues.

use std::collections::BTreeMap;

use crate::packet::Packet;

/// One queued packet plus its transmission bookkeeping.
pub(crate) struct QueueNode {
    pub packet: Packet,
    /// When the packet was last transmitted, `None` if it never was.
    pub sent: Option<i64>,
    /// When the packet was first transmitted. Anchors RTT samples.
    pub sent_1: Option<i64>,
    /// Times a later seq was selectively acknowledged while this one was
    /// not. Drives fast retransmission.
    pub miss: u32,
}

impl QueueNode {
    pub fn new(packet: Packet) -> QueueNode {
        QueueNode {
            packet,
            sent: None,
            sent_1: None,
            miss: 0,
        }
    }

    pub fn mark_sent(&mut self, now: i64) {
        self.packet.scnt = self.packet.scnt.saturating_add(1);
        self.sent = Some(now);
        self.sent_1.get_or_insert(now);
    }
}

/// An ordered mapping seq -> [`QueueNode`].
///
/// Iteration order always equals strictly increasing seq order. Outbound it
/// holds every packet transmitted but not yet confirmed acknowledged;
/// inbound it holds packets waiting for reassembly.
#[derive(Default)]
pub(crate) struct OrderedQueue {
    nodes: BTreeMap<u32, QueueNode>,
}

impl OrderedQueue {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.nodes.contains_key(&seq)
    }

    /// Append a node whose seq must exceed the current tail's.
    pub fn push_back(&mut self, node: QueueNode) {
        debug_assert!(
            self.nodes
                .last_key_value()
                .is_none_or(|(&tail, _)| node.packet.seq > tail)
        );

        self.nodes.insert(node.packet.seq, node);
    }

    /// Insert a node at its seq position. Returns `false` on duplicates.
    pub fn insert(&mut self, node: QueueNode) -> bool {
        if self.nodes.contains_key(&node.packet.seq) {
            return false;
        }

        self.nodes.insert(node.packet.seq, node);

        true
    }

    pub fn head_seq(&self) -> Option<u32> {
        self.nodes.first_key_value().map(|(&seq, _)| seq)
    }

    pub fn pop_head(&mut self) -> Option<QueueNode> {
        self.nodes.pop_first().map(|(_, node)| node)
    }

    pub fn remove(&mut self, seq: u32) -> Option<QueueNode> {
        self.nodes.remove(&seq)
    }

    pub fn get_mut(&mut self, seq: u32) -> Option<&mut QueueNode> {
        self.nodes.get_mut(&seq)
    }

    /// Remove nodes from the head while `head.seq <= seq`, returning them in
    /// seq order.
    pub fn drop_head_until(&mut self, seq: u32) -> Vec<QueueNode> {
        let mut dropped = Vec::new();

        while let Some((&head, _)) = self.nodes.first_key_value() {
            if head > seq {
                break;
            }

            if let Some((_, node)) = self.nodes.pop_first() {
                dropped.push(node);
            }
        }

        dropped
    }

    /// The first queued seq strictly greater than `seq`.
    pub fn first_seq_after(&self, seq: u32) -> Option<u32> {
        self.nodes
            .range(seq.saturating_add(1)..)
            .next()
            .map(|(&s, _)| s)
    }

    /// Forward traversal starting at the first node with seq >= `seq`.
    pub fn iter_from(&self, seq: u32) -> impl Iterator<Item = &QueueNode> {
        self.nodes.range(seq..).map(|(_, node)| node)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueueNode> {
        self.nodes.values_mut()
    }

    pub fn range_mut(
        &mut self,
        range: std::ops::Range<u32>,
    ) -> impl Iterator<Item = &mut QueueNode> {
        self.nodes.range_mut(range).map(|(_, node)| node)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::packet::{Flags, Packet};

    fn node(seq: u32) -> QueueNode {
        QueueNode::new(Packet {
            seq,
            ack: 0,
            flags: Flags::DATA,
            scnt: 0,
            payload: Bytes::new(),
        })
    }

    #[test]
    fn drop_head_until_removes_exactly_the_prefix() {
        let mut q = OrderedQueue::default();
        for seq in [1, 2, 3, 5, 8] {
            q.push_back(node(seq));
        }

        let dropped = q.drop_head_until(5);

        assert_eq!(
            dropped.iter().map(|n| n.packet.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 5]
        );
        assert_eq!(q.head_seq(), Some(8));
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut q = OrderedQueue::default();

        assert!(q.insert(node(4)));
        assert!(!q.insert(node(4)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn first_seq_after_skips_earlier_nodes() {
        let mut q = OrderedQueue::default();
        for seq in [2, 4, 9] {
            q.push_back(node(seq));
        }

        assert_eq!(q.first_seq_after(2), Some(4));
        assert_eq!(q.first_seq_after(9), None);
    }

    proptest! {
        #[test]
        fn iteration_order_is_increasing_seq_order(seqs in prop::collection::btree_set(1u32..10_000, 0..64)) {
            let mut q = OrderedQueue::default();
            for &seq in &seqs {
                q.insert(node(seq));
            }

            let iterated = q.iter_from(0).map(|n| n.packet.seq).collect::<Vec<_>>();
            let expected = seqs.iter().copied().collect::<Vec<_>>();

            prop_assert_eq!(iterated, expected);
        }

        #[test]
        fn drop_head_until_partitions_the_queue(
            seqs in prop::collection::btree_set(1u32..10_000, 0..64),
            cut in 0u32..10_000,
        ) {
            let mut q = OrderedQueue::default();
            for &seq in &seqs {
                q.insert(node(seq));
            }

            let dropped = q.drop_head_until(cut);

            prop_assert!(dropped.iter().all(|n| n.packet.seq <= cut));
            prop_assert!(q.iter_from(0).all(|n| n.packet.seq > cut));
            prop_assert_eq!(dropped.len() + q.len(), seqs.len());
        }
    }
}
