use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::Bytes;

use super::payload_queue::*;
use super::pending_queue::*;
use super::reassembly_queue::*;
use crate::chunk::chunk_data::{ChunkData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};

fn make_data_chunk(tsn: u32, unordered: bool, user_data: &[u8]) -> ChunkData {
    ChunkData {
        tsn,
        unordered,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::copy_from_slice(user_data),
        payload_type: PayloadProtocolIdentifier::Binary,
        ..Default::default()
    }
}

fn make_payload_queue(n: u32, base_tsn: u32) -> PayloadQueue {
    let mut pq = PayloadQueue::new(Arc::new(AtomicUsize::new(0)));
    for i in 0..n {
        pq.push(make_data_chunk(base_tsn + i, false, &[42]), base_tsn - 1);
    }
    pq
}

///////////////////////////////////////////////////////////////////
// payload_queue_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_payload_queue_push_and_pop_in_order() {
    let mut pq = make_payload_queue(3, 100);
    assert_eq!(pq.len(), 3);
    assert_eq!(pq.get_num_bytes(), 3);

    // popping out of order yields nothing
    assert!(pq.pop(101).is_none());

    for tsn in 100..103u32 {
        let c = pq.pop(tsn);
        assert!(c.is_some(), "pop should succeed for TSN {tsn}");
    }
    assert!(pq.is_empty());
    assert_eq!(pq.get_num_bytes(), 0);
}

#[test]
fn test_payload_queue_duplicate_tracking() {
    let mut pq = make_payload_queue(3, 10);

    // same TSN again
    assert!(!pq.push(make_data_chunk(11, false, &[42]), 9));
    // at or below the cumulative ack point
    assert!(!pq.push(make_data_chunk(9, false, &[42]), 9));

    assert_eq!(pq.pop_duplicates(), vec![11, 9]);
    assert!(pq.pop_duplicates().is_empty(), "drain must clear the log");
}

#[test]
fn test_payload_queue_gap_ack_blocks() {
    let mut pq = PayloadQueue::new(Arc::new(AtomicUsize::new(0)));
    // cumulative TSN is 6; received 8,9 and 12
    pq.push(make_data_chunk(8, false, &[0]), 6);
    pq.push(make_data_chunk(9, false, &[0]), 6);
    pq.push(make_data_chunk(12, false, &[0]), 6);

    let gabs = pq.get_gap_ack_blocks(6);
    assert_eq!(gabs.len(), 2);
    assert_eq!((gabs[0].start, gabs[0].end), (2, 3));
    assert_eq!((gabs[1].start, gabs[1].end), (6, 6));
}

#[test]
fn test_payload_queue_gap_ack_blocks_out_of_order_arrival() {
    let mut pq = PayloadQueue::new(Arc::new(AtomicUsize::new(0)));
    for tsn in [12u32, 8, 9] {
        pq.push(make_data_chunk(tsn, false, &[0]), 6);
    }
    // sorted insertion makes arrival order irrelevant
    let gabs = pq.get_gap_ack_blocks(6);
    assert_eq!(gabs.len(), 2);
    assert_eq!((gabs[0].start, gabs[0].end), (2, 3));
    assert_eq!((gabs[1].start, gabs[1].end), (6, 6));
}

#[test]
fn test_payload_queue_mark_as_acked_releases_bytes() {
    let mut pq = make_payload_queue(1, 42);
    let n = pq.mark_as_acked(42);
    assert_eq!(n, 1);
    assert_eq!(pq.get_num_bytes(), 0);
    // the entry itself stays until the cumulative point passes it
    assert_eq!(pq.len(), 1);
    assert!(pq.get(42).map(|c| c.acked).unwrap_or_default());
}

#[test]
fn test_payload_queue_mark_all_to_retransmit() {
    let mut pq = make_payload_queue(3, 1);
    pq.mark_as_acked(2);
    pq.mark_all_to_retransmit();

    assert!(pq.get(1).map(|c| c.retransmit).unwrap_or_default());
    assert!(!pq.get(2).map(|c| c.retransmit).unwrap_or_default());
    assert!(pq.get(3).map(|c| c.retransmit).unwrap_or_default());
}

#[test]
fn test_payload_queue_last_tsn_received() {
    let mut pq = PayloadQueue::new(Arc::new(AtomicUsize::new(0)));
    assert!(pq.get_last_tsn_received().is_none());
    pq.push(make_data_chunk(20, false, &[0]), 9);
    pq.push(make_data_chunk(10, false, &[0]), 9);
    assert_eq!(pq.get_last_tsn_received(), Some(&20));
}

///////////////////////////////////////////////////////////////////
// pending_queue_test
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_pending_queue_unordered_is_served_first() -> Result<()> {
    let pq = PendingQueue::new();

    pq.push(make_data_chunk(0, false, b"012")).await;
    pq.push(make_data_chunk(1, true, b"3456")).await;
    assert_eq!(pq.len(), 2);
    assert_eq!(pq.get_num_bytes(), 7);

    let c = pq.peek().ok_or(Error::ErrTryAgain)?;
    assert!(c.unordered, "unordered chunk should be scheduled first");
    pq.pop(c.beginning_fragment, c.unordered)
        .ok_or(Error::ErrTryAgain)?;

    let c = pq.peek().ok_or(Error::ErrTryAgain)?;
    assert!(!c.unordered);
    pq.pop(c.beginning_fragment, c.unordered)
        .ok_or(Error::ErrTryAgain)?;

    assert!(pq.is_empty());
    assert_eq!(pq.get_num_bytes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_pending_queue_fragments_stay_together() -> Result<()> {
    let pq = PendingQueue::new();

    // an ordered message in three fragments
    let mut frags = vec![];
    for (i, (b, e)) in [(true, false), (false, false), (false, true)]
        .iter()
        .enumerate()
    {
        let mut c = make_data_chunk(i as u32, false, &[i as u8]);
        c.beginning_fragment = *b;
        c.ending_fragment = *e;
        frags.push(c);
    }
    pq.append(frags).await;

    // an unordered chunk arriving while the fragment train is queued
    pq.push(make_data_chunk(9, true, &[9])).await;

    // first pop selects the ordered queue and must hold the selection
    // until the ending fragment leaves
    let c = pq.peek().ok_or(Error::ErrTryAgain)?;
    assert!(c.unordered, "peek before selection prefers unordered");
    let c = pq.pop(true, true).ok_or(Error::ErrTryAgain)?;
    assert_eq!(c.tsn, 9);

    for expected_tsn in 0..3u32 {
        let c = pq.peek().ok_or(Error::ErrTryAgain)?;
        let c = pq
            .pop(c.beginning_fragment, c.unordered)
            .ok_or(Error::ErrTryAgain)?;
        assert_eq!(c.tsn, expected_tsn);
    }
    assert!(pq.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pending_queue_mid_fragment_pop_without_selection() -> Result<()> {
    let pq = PendingQueue::new();
    let mut c = make_data_chunk(0, false, &[0]);
    c.beginning_fragment = false;
    c.ending_fragment = false;
    pq.push(c).await;

    // a non-beginning fragment cannot start a drain
    assert!(pq.pop(false, false).is_none());
    assert_eq!(pq.len(), 1);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// reassembly_queue_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_reassembly_ordered_in_sequence() -> Result<()> {
    let mut rq = ReassemblyQueue::new(0);

    let mut c = make_data_chunk(1, false, b"first");
    c.stream_sequence_number = 0;
    assert!(rq.push(c));
    assert!(rq.is_readable());

    let (data, ppi) = rq.read()?;
    assert_eq!(&data[..], b"first");
    assert_eq!(ppi, PayloadProtocolIdentifier::Binary);
    assert_eq!(rq.get_num_bytes(), 0);
    Ok(())
}

#[test]
fn test_reassembly_ordered_holds_until_turn() -> Result<()> {
    let mut rq = ReassemblyQueue::new(0);

    // SSN 1 arrives before SSN 0
    let mut c = make_data_chunk(2, false, b"second");
    c.stream_sequence_number = 1;
    rq.push(c);
    assert!(!rq.is_readable(), "SSN 1 must wait for SSN 0");
    assert!(rq.read().is_err());

    let mut c = make_data_chunk(1, false, b"first");
    c.stream_sequence_number = 0;
    rq.push(c);

    let (data, _) = rq.read()?;
    assert_eq!(&data[..], b"first");
    let (data, _) = rq.read()?;
    assert_eq!(&data[..], b"second");
    Ok(())
}

#[test]
fn test_reassembly_ordered_fragments() -> Result<()> {
    let mut rq = ReassemblyQueue::new(0);

    let mut a = make_data_chunk(10, false, b"AB");
    a.ending_fragment = false;
    let mut b = make_data_chunk(11, false, b"CD");
    b.beginning_fragment = false;

    assert!(!rq.push(a), "incomplete set is not deliverable");
    assert!(rq.push(b));

    let (data, _) = rq.read()?;
    assert_eq!(&data[..], b"ABCD");
    Ok(())
}

#[test]
fn test_reassembly_unordered_out_of_order_fragments() -> Result<()> {
    let mut rq = ReassemblyQueue::new(0);

    let mut a = make_data_chunk(5, true, b"AB");
    a.ending_fragment = false;
    let mut b = make_data_chunk(6, true, b"CD");
    b.beginning_fragment = false;
    b.ending_fragment = false;
    let mut c = make_data_chunk(7, true, b"EF");
    c.beginning_fragment = false;

    // middle, end, then beginning
    assert!(!rq.push(b));
    assert!(!rq.push(c));
    assert!(rq.push(a));

    let (data, _) = rq.read()?;
    assert_eq!(&data[..], b"ABCDEF");
    Ok(())
}

#[test]
fn test_reassembly_ignores_other_stream() {
    let mut rq = ReassemblyQueue::new(7);
    let c = make_data_chunk(1, false, b"nope");
    assert!(!rq.push(c), "stream 0 chunk must not enter stream 7 queue");
    assert_eq!(rq.get_num_bytes(), 0);
}

#[test]
fn test_reassembly_drops_old_ssn() {
    let mut rq = ReassemblyQueue::new(0);
    rq.next_ssn = 5;

    let mut c = make_data_chunk(1, false, b"old");
    c.stream_sequence_number = 4;
    assert!(!rq.push(c));
    assert_eq!(rq.get_num_bytes(), 0, "stale chunk must not be counted");
}

#[test]
fn test_reassembly_forward_tsn_for_ordered() -> Result<()> {
    let mut rq = ReassemblyQueue::new(0);

    // SSN 0 incomplete (abandoned by the sender), SSN 1 complete
    let mut a = make_data_chunk(1, false, b"AB");
    a.ending_fragment = false;
    a.stream_sequence_number = 0;
    rq.push(a);

    let mut b = make_data_chunk(3, false, b"CD");
    b.stream_sequence_number = 1;
    rq.push(b);

    assert!(!rq.is_readable());

    rq.forward_tsn_for_ordered(0);

    assert!(rq.is_readable(), "SSN 1 becomes deliverable after the skip");
    let (data, _) = rq.read()?;
    assert_eq!(&data[..], b"CD");
    assert_eq!(rq.next_ssn, 2);
    Ok(())
}

#[test]
fn test_reassembly_forward_tsn_for_unordered() {
    let mut rq = ReassemblyQueue::new(0);

    // loose fragment at TSN 3, never completed
    let mut a = make_data_chunk(3, true, b"AB");
    a.ending_fragment = false;
    rq.push(a);
    assert_eq!(rq.get_num_bytes(), 2);

    rq.forward_tsn_for_unordered(4);
    assert_eq!(rq.get_num_bytes(), 0);
    assert!(!rq.is_readable());
}
