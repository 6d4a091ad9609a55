use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::*;
use crate::association::AssociationState;
use crate::chunk::chunk_data::{ChunkData, PayloadProtocolIdentifier};
use crate::queue::pending_queue::PendingQueue;

fn make_stream() -> Stream {
    let (awake_tx, _awake_rx) = mpsc::channel(1);
    Stream::new(
        "test".to_owned(),
        1,
        10, // small fragments on purpose
        Arc::new(AtomicU32::new(65536)),
        Arc::new(AtomicU8::new(AssociationState::Established as u8)),
        Arc::new(awake_tx),
        Arc::new(PendingQueue::new()),
    )
}

fn drain_pending(s: &Stream) -> Vec<ChunkData> {
    let mut chunks = vec![];
    while let Some(c) = s.pending_queue.peek() {
        let popped = s
            .pending_queue
            .pop(c.beginning_fragment, c.unordered)
            .unwrap();
        chunks.push(popped);
    }
    chunks
}

struct Collector {
    message_tx: mpsc::UnboundedSender<Message>,
    closed_tx: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl StreamListener for Collector {
    async fn on_message(&mut self, message: Message) {
        let _ = self.message_tx.send(message);
    }

    async fn on_stream_closed(&mut self) {
        let _ = self.closed_tx.send(());
    }
}

fn make_collector() -> (
    Box<dyn StreamListener + Send + Sync>,
    mpsc::UnboundedReceiver<Message>,
    mpsc::UnboundedReceiver<()>,
) {
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    (
        Box::new(Collector {
            message_tx,
            closed_tx,
        }),
        message_rx,
        closed_rx,
    )
}

#[tokio::test]
async fn test_send_fragments_large_message() -> Result<()> {
    let s = make_stream();
    s.send(Bytes::from_static(&[0u8; 25])).await?;

    let chunks = drain_pending(&s);
    assert_eq!(chunks.len(), 3, "25 bytes at max_payload_size 10");
    assert!(chunks[0].beginning_fragment);
    assert!(!chunks[0].ending_fragment);
    assert!(!chunks[1].beginning_fragment);
    assert!(!chunks[1].ending_fragment);
    assert!(chunks[2].ending_fragment);
    assert_eq!(chunks[2].user_data.len(), 5);
    for c in &chunks {
        assert_eq!(c.stream_sequence_number, 0);
        assert_eq!(c.payload_type, PayloadProtocolIdentifier::Binary);
    }
    assert_eq!(s.buffered_amount(), 25);

    s.send(Bytes::from_static(&[1u8; 4])).await?;
    let chunks = drain_pending(&s);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].stream_sequence_number, 1, "SSN per message");
    Ok(())
}

#[tokio::test]
async fn test_unordered_send_does_not_advance_ssn() -> Result<()> {
    let s = make_stream();
    s.set_reliability_params(true, ReliabilityType::Reliable, 0);

    s.send(Bytes::from_static(&[0u8; 4])).await?;
    s.send(Bytes::from_static(&[0u8; 4])).await?;

    let chunks = drain_pending(&s);
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].unordered);
    assert_eq!(chunks[0].stream_sequence_number, 0);
    assert_eq!(chunks[1].stream_sequence_number, 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_message_occupies_one_byte_on_the_wire() -> Result<()> {
    let s = make_stream();
    s.send(Bytes::new()).await?;
    s.send_text("").await?;

    let chunks = drain_pending(&s);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].payload_type, PayloadProtocolIdentifier::BinaryEmpty);
    assert_eq!(&chunks[0].user_data[..], &[0]);
    assert_eq!(chunks[1].payload_type, PayloadProtocolIdentifier::StringEmpty);
    assert_eq!(&chunks[1].user_data[..], &[0]);
    Ok(())
}

#[tokio::test]
async fn test_send_rejections() {
    let s = make_stream();

    let too_big = Bytes::from(vec![0u8; 65537]);
    assert_eq!(s.send(too_big).await, Err(Error::ErrPayloadTooBig));

    s.state
        .store(AssociationState::Closed as u8, Ordering::SeqCst);
    assert_eq!(
        s.send(Bytes::from_static(&[1])).await,
        Err(Error::ErrNotEstablished)
    );

    s.state
        .store(AssociationState::Established as u8, Ordering::SeqCst);
    s.notify_closed();
    assert_eq!(
        s.send(Bytes::from_static(&[1])).await,
        Err(Error::ErrStreamClosed)
    );
}

#[tokio::test]
async fn test_messages_buffered_until_listener_attached() -> Result<()> {
    let s = make_stream();

    s.deliver(
        Bytes::from_static(b"first"),
        PayloadProtocolIdentifier::String,
    );
    s.deliver(
        Bytes::from_static(&[1, 2, 3]),
        PayloadProtocolIdentifier::Binary,
    );

    let (listener, mut message_rx, mut closed_rx) = make_collector();
    s.set_listener(listener);

    assert_eq!(
        message_rx.recv().await,
        Some(Message::Text("first".to_owned()))
    );
    assert_eq!(
        message_rx.recv().await,
        Some(Message::Binary(Bytes::from_static(&[1, 2, 3])))
    );

    s.notify_closed();
    assert_eq!(closed_rx.recv().await, Some(()));
    Ok(())
}

#[tokio::test]
async fn test_handle_data_returns_complete_messages() -> Result<()> {
    let s = make_stream();

    let complete = s
        .handle_data(ChunkData {
            tsn: 1,
            stream_identifier: 1,
            stream_sequence_number: 0,
            beginning_fragment: true,
            ending_fragment: true,
            payload_type: PayloadProtocolIdentifier::String,
            user_data: Bytes::from_static(b"hello"),
            ..Default::default()
        })
        .await;

    assert_eq!(complete.len(), 1);
    assert_eq!(&complete[0].0[..], b"hello");
    assert_eq!(complete[0].1, PayloadProtocolIdentifier::String);
    Ok(())
}

#[tokio::test]
async fn test_send_and_block_waits_for_drain() -> Result<()> {
    let s = Arc::new(make_stream());

    let s2 = Arc::clone(&s);
    let blocked = tokio::spawn(async move { s2.send_and_block(Bytes::from_static(&[0u8; 5])).await });

    // wait for the sender to queue its bytes
    let mut backoff = 0;
    while s.buffered_amount() != 5 && backoff < 100 {
        tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
        backoff += 1;
    }
    assert_eq!(s.buffered_amount(), 5);
    assert!(!blocked.is_finished());

    s.on_buffer_released(5);
    let result = tokio::time::timeout(tokio::time::Duration::from_secs(1), blocked).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
    Ok(())
}

#[tokio::test]
async fn test_send_and_block_fails_when_stream_closes() -> Result<()> {
    let s = Arc::new(make_stream());

    let s2 = Arc::clone(&s);
    let blocked = tokio::spawn(async move { s2.send_and_block(Bytes::from_static(&[0u8; 5])).await });

    let mut backoff = 0;
    while s.buffered_amount() != 5 && backoff < 100 {
        tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
        backoff += 1;
    }

    s.notify_closed();
    let result = tokio::time::timeout(tokio::time::Duration::from_secs(1), blocked).await;
    assert!(matches!(result, Ok(Ok(Err(Error::ErrStreamClosed)))));
    Ok(())
}

#[test]
fn test_message_from_wire_mapping() {
    assert_eq!(
        Message::from_wire(
            Bytes::from_static(b"hi"),
            PayloadProtocolIdentifier::String
        ),
        Message::Text("hi".to_owned())
    );
    assert_eq!(
        Message::from_wire(
            Bytes::from_static(&[0]),
            PayloadProtocolIdentifier::StringEmpty
        ),
        Message::Text(String::new())
    );
    assert_eq!(
        Message::from_wire(
            Bytes::from_static(&[0]),
            PayloadProtocolIdentifier::BinaryEmpty
        ),
        Message::Binary(Bytes::new())
    );
    // unknown PPI values fall back to binary
    assert_eq!(
        Message::from_wire(
            Bytes::from_static(&[9]),
            PayloadProtocolIdentifier::Unknown
        ),
        Message::Binary(Bytes::from_static(&[9]))
    );
}
