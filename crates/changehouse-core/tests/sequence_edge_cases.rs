//! Edge-case tests for the sequence containers working together:
//! the pending heap as a reorder buffer, the skipped queue as the gap
//! ledger, and the received set as the dedup horizon.

use changehouse_core::{ChangeEntry, PendingQueue, ReceivedSequences, SkippedSequenceQueue};

#[test]
fn test_reorder_buffer_replays_a_shuffled_window() {
    let mut pending = PendingQueue::new();
    let mut received = ReceivedSequences::new(0);
    let mut next_sequence = 1u64;

    // Sequences 1..=8 arrive shuffled.
    for seq in [4, 1, 7, 3, 2, 8, 5, 6] {
        assert!(!received.contains(seq));
        received.insert(seq);
        pending.push(ChangeEntry::placeholder(seq));
    }

    let mut delivered = Vec::new();
    while let Some(head_sequence) = pending.peek().map(|e| e.sequence) {
        assert_eq!(head_sequence, next_sequence, "no gaps in this window");
        delivered.extend(pending.pop().map(|e| e.sequence));
        next_sequence += 1;
    }
    assert_eq!(delivered, (1..=8).collect::<Vec<u64>>());
}

#[test]
fn test_gap_ledger_round_trip() {
    let mut skipped = SkippedSequenceQueue::new();
    let mut received = ReceivedSequences::new(0);

    // Sequences 2 and 5 went missing while the watermark moved to 7.
    for seq in [1, 3, 4, 6] {
        received.insert(seq);
    }
    skipped.push(2).expect("push 2");
    skipped.push(5).expect("push 5");

    // The dedup floor may not pass the oldest outstanding gap.
    let floor = 6u64.min(skipped.front().map(|s| s.seq - 1).expect("front"));
    received.prune_to(floor);
    assert_eq!(received.floor(), 1);
    assert!(!received.contains(2));
    assert!(!received.contains(5));

    // Sequence 2 is recovered; the floor can then advance to the next gap.
    skipped.remove(2).expect("remove 2");
    received.insert(2);
    let floor = 6u64.min(skipped.front().map(|s| s.seq - 1).expect("front"));
    received.prune_to(floor);
    assert_eq!(received.floor(), 4);
    assert!(received.contains(2));
    assert!(!received.contains(5));

    // Sequence 5 is abandoned; everything below the watermark is resolved.
    skipped.remove(5).expect("remove 5");
    assert!(skipped.is_empty());
    received.prune_to(6);
    assert_eq!(received.len_above_floor(), 0);
    assert!(received.contains(5));
}

#[test]
fn test_skipped_queue_stays_ordered_under_mixed_removals() {
    let mut skipped = SkippedSequenceQueue::new();
    for seq in [10, 20, 30, 40, 50] {
        skipped.push(seq).expect("push");
    }
    skipped.remove(30).expect("remove middle");
    skipped.remove(10).expect("remove front");
    skipped.remove(50).expect("remove back");

    let left: Vec<u64> = skipped.iter().map(|s| s.seq).collect();
    assert_eq!(left, vec![20, 40]);
    // New pushes must still clear the remaining maximum.
    assert!(skipped.push(40).is_err());
    skipped.push(41).expect("push above max");
}

#[test]
fn test_pending_heap_tolerates_sparse_sequences() {
    let mut pending = PendingQueue::new();
    for seq in [1_000_000, 3, u64::MAX, 42] {
        pending.push(ChangeEntry::placeholder(seq));
    }
    let order: Vec<u64> = std::iter::from_fn(|| pending.pop().map(|e| e.sequence)).collect();
    assert_eq!(order, vec![3, 42, 1_000_000, u64::MAX]);
}
