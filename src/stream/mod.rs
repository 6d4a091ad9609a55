#[cfg(test)]
mod stream_test;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::association::AssociationState;
use crate::chunk::chunk_data::{ChunkData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::queue::pending_queue::PendingQueue;
use crate::queue::reassembly_queue::ReassemblyQueue;

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum ReliabilityType {
    /// Every chunk is retransmitted until acknowledged.
    #[default]
    Reliable = 0,
    /// Retransmitted at most `reliability_value` times, then abandoned.
    Rexmit = 1,
    /// Retransmitted for at most `reliability_value` msec, then abandoned.
    Timed = 2,
}

impl fmt::Display for ReliabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReliabilityType::Reliable => "Reliable",
            ReliabilityType::Rexmit => "Rexmit",
            ReliabilityType::Timed => "Timed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for ReliabilityType {
    fn from(v: u8) -> ReliabilityType {
        match v {
            1 => ReliabilityType::Rexmit,
            2 => ReliabilityType::Timed,
            _ => ReliabilityType::Reliable,
        }
    }
}

/// A complete user message delivered on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub(crate) fn from_wire(data: Bytes, ppi: PayloadProtocolIdentifier) -> Self {
        match ppi {
            PayloadProtocolIdentifier::String => {
                Message::Text(String::from_utf8_lossy(&data).into_owned())
            }
            PayloadProtocolIdentifier::StringEmpty => Message::Text(String::new()),
            PayloadProtocolIdentifier::BinaryEmpty => Message::Binary(Bytes::new()),
            _ => Message::Binary(data),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(s) => s.len(),
            Message::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives messages and lifecycle events of one stream. Callbacks for a
/// given stream are serialized in delivery order; there is no ordering
/// guarantee across streams.
#[async_trait]
pub trait StreamListener {
    async fn on_message(&mut self, message: Message);
    async fn on_stream_closed(&mut self) {}
}

enum StreamEvent {
    Message(Message),
    Closed,
}

type ListenerHandle = ArcSwapOption<Mutex<Box<dyn StreamListener + Send + Sync>>>;

/// One SCTP stream: an outbound sequence-number space plus an inbound
/// reassembly queue. Created through
/// [`Association::open_stream`](crate::Association::open_stream) or
/// announced by the association listener for inbound streams.
pub struct Stream {
    pub(crate) max_payload_size: u32,
    pub(crate) max_message_size: Arc<AtomicU32>, // clone from association
    pub(crate) state: Arc<AtomicU8>,             // clone from association
    pub(crate) awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    pub(crate) pending_queue: Arc<PendingQueue>,

    pub(crate) stream_identifier: u16,
    pub(crate) reassembly_queue: Mutex<ReassemblyQueue>,
    pub(crate) sequence_number: AtomicU16,
    pub(crate) closed: AtomicBool,
    pub(crate) unordered: AtomicBool,
    pub(crate) reliability_type: AtomicU8,
    pub(crate) reliability_value: AtomicU32,
    pub(crate) buffered_amount: AtomicUsize,
    pub(crate) drain_notify: Notify,

    listener: Arc<ListenerHandle>,
    listener_set: Arc<Notify>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,

    pub(crate) name: String,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_identifier", &self.stream_identifier)
            .field("sequence_number", &self.sequence_number)
            .field("closed", &self.closed)
            .field("unordered", &self.unordered)
            .field("reliability_type", &self.reliability_type)
            .field("reliability_value", &self.reliability_value)
            .field("buffered_amount", &self.buffered_amount)
            .field("name", &self.name)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        name: String,
        stream_identifier: u16,
        max_payload_size: u32,
        max_message_size: Arc<AtomicU32>,
        state: Arc<AtomicU8>,
        awake_write_loop_ch: Arc<mpsc::Sender<()>>,
        pending_queue: Arc<PendingQueue>,
    ) -> Self {
        let listener: Arc<ListenerHandle> = Arc::new(ArcSwapOption::empty());
        let listener_set = Arc::new(Notify::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // One delivery task per stream serializes the listener callbacks.
        // Events queue up until a listener is attached.
        tokio::spawn(Self::delivery_loop(
            Arc::clone(&listener),
            Arc::clone(&listener_set),
            event_rx,
        ));

        Self {
            max_payload_size,
            max_message_size,
            state,
            awake_write_loop_ch,
            pending_queue,

            stream_identifier,
            reassembly_queue: Mutex::new(ReassemblyQueue::new(stream_identifier)),
            sequence_number: AtomicU16::new(0),
            closed: AtomicBool::new(false),
            unordered: AtomicBool::new(false),
            reliability_type: AtomicU8::new(0),
            reliability_value: AtomicU32::new(0),
            buffered_amount: AtomicUsize::new(0),
            drain_notify: Notify::new(),

            listener,
            listener_set,
            event_tx,

            name,
        }
    }

    async fn delivery_loop(
        listener: Arc<ListenerHandle>,
        listener_set: Arc<Notify>,
        mut event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let handler = loop {
                let notified = listener_set.notified();
                if let Some(handler) = listener.load_full() {
                    break handler;
                }
                notified.await;
            };

            let mut handler = handler.lock().await;
            match event {
                StreamEvent::Message(message) => handler.on_message(message).await,
                StreamEvent::Closed => {
                    handler.on_stream_closed().await;
                    return;
                }
            }
        }
    }

    /// The stream identifier this stream sends and receives on.
    pub fn stream_identifier(&self) -> u16 {
        self.stream_identifier
    }

    /// Attaches the listener that receives this stream's messages. Messages
    /// that arrived before the listener was attached are delivered, in
    /// order, as soon as it is.
    pub fn set_listener(&self, listener: Box<dyn StreamListener + Send + Sync>) {
        self.listener.store(Some(Arc::new(Mutex::new(listener))));
        self.listener_set.notify_one();
    }

    /// Sets delivery-mode parameters, usually from a negotiated DCEP
    /// channel type.
    pub fn set_reliability_params(&self, unordered: bool, rel_type: ReliabilityType, rel_val: u32) {
        log::debug!(
            "[{}] reliability params: ordered={} type={} value={}",
            self.name,
            !unordered,
            rel_type,
            rel_val
        );
        self.unordered.store(unordered, Ordering::SeqCst);
        self.reliability_type
            .store(rel_type as u8, Ordering::SeqCst);
        self.reliability_value.store(rel_val, Ordering::SeqCst);
    }

    /// Enqueues a binary message for transmission.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let ppi = if data.is_empty() {
            PayloadProtocolIdentifier::BinaryEmpty
        } else {
            PayloadProtocolIdentifier::Binary
        };
        self.send_with_ppi(data, ppi).await
    }

    /// Enqueues a text message for transmission.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let ppi = if text.is_empty() {
            PayloadProtocolIdentifier::StringEmpty
        } else {
            PayloadProtocolIdentifier::String
        };
        self.send_with_ppi(Bytes::copy_from_slice(text.as_bytes()), ppi)
            .await
    }

    /// Enqueues a message and suspends the caller until every byte of it
    /// (and anything queued before it) has been acknowledged by the peer,
    /// or the stream fails.
    pub async fn send_and_block(&self, data: Bytes) -> Result<()> {
        self.send(data).await?;

        loop {
            let notified = self.drain_notify.notified();
            if self.buffered_amount.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ErrStreamClosed);
            }
            notified.await;
        }
    }

    pub(crate) async fn send_with_ppi(
        &self,
        data: Bytes,
        ppi: PayloadProtocolIdentifier,
    ) -> Result<()> {
        let chunks = self.prepare_write(&data, ppi)?;

        // append keeps the fragments of one message adjacent in the
        // pending queue
        self.pending_queue.append(chunks).await;
        self.awake_write_loop();
        Ok(())
    }

    fn prepare_write(&self, p: &Bytes, ppi: PayloadProtocolIdentifier) -> Result<Vec<ChunkData>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrStreamClosed);
        }
        if p.len() > self.max_message_size.load(Ordering::SeqCst) as usize {
            return Err(Error::ErrPayloadTooBig);
        }
        if self.get_state() != AssociationState::Established {
            return Err(Error::ErrNotEstablished);
        }

        Ok(self.packetize(p, ppi))
    }

    fn packetize(&self, raw: &Bytes, ppi: PayloadProtocolIdentifier) -> Vec<ChunkData> {
        let mut i = 0;
        let mut remaining = if raw.is_empty() { 1 } else { raw.len() };

        // DCEP messages are always sent ordered and reliable
        // (RFC 8832 section 4).
        let unordered =
            ppi != PayloadProtocolIdentifier::Dcep && self.unordered.load(Ordering::SeqCst);

        // an empty message still occupies one DATA chunk on the wire
        let zero = Bytes::from_static(&[0]);
        let raw = if raw.is_empty() { &zero } else { raw };

        let mut chunks = vec![];

        // all fragments of one message share the abandonment state
        let head_abandoned = Arc::new(AtomicBool::new(false));
        let head_all_inflight = Arc::new(AtomicBool::new(false));
        while remaining != 0 {
            let fragment_size = std::cmp::min(self.max_payload_size as usize, remaining);

            // slice the user data; it is retained until acked
            let user_data = raw.slice(i..i + fragment_size);

            chunks.push(ChunkData {
                stream_identifier: self.stream_identifier,
                user_data,
                unordered,
                beginning_fragment: i == 0,
                ending_fragment: remaining - fragment_size == 0,
                payload_type: ppi,
                stream_sequence_number: self.sequence_number.load(Ordering::SeqCst),
                abandoned: head_abandoned.clone(),
                all_inflight: head_all_inflight.clone(),
                ..Default::default()
            });

            remaining -= fragment_size;
            i += fragment_size;
        }

        // RFC 4960 section 6.6: the SSN is not incremented for chunks sent
        // with the U flag set.
        if !unordered {
            self.sequence_number.fetch_add(1, Ordering::SeqCst);
        }

        let n_bytes = chunks.iter().map(|c| c.user_data.len()).sum::<usize>();
        let old_value = self.buffered_amount.fetch_add(n_bytes, Ordering::SeqCst);
        log::trace!("[{}] bufferedAmount = {}", self.name, old_value + n_bytes);

        chunks
    }

    /// Requests a reset of this stream (RFC 6525). The peer's confirmation
    /// eventually fires `on_stream_closed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send_reset_request().await
    }

    /// Number of bytes queued on this stream and not yet acknowledged.
    pub fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    /// Feeds one inbound DATA chunk into reassembly and returns the
    /// complete messages it unlocked, in delivery order.
    pub(crate) async fn handle_data(
        &self,
        pd: ChunkData,
    ) -> Vec<(Bytes, PayloadProtocolIdentifier)> {
        let mut complete = vec![];

        let mut reassembly_queue = self.reassembly_queue.lock().await;
        if reassembly_queue.push(pd) {
            while let Ok(assembled) = reassembly_queue.read() {
                complete.push(assembled);
            }
        }

        complete
    }

    /// Queues a complete message for the listener.
    pub(crate) fn deliver(&self, data: Bytes, ppi: PayloadProtocolIdentifier) {
        let _ = self
            .event_tx
            .send(StreamEvent::Message(Message::from_wire(data, ppi)));
    }

    /// Marks the stream closed (reset confirmed or association torn down),
    /// fires `on_stream_closed` and unblocks pending senders.
    pub(crate) fn notify_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.event_tx.send(StreamEvent::Closed);
        self.drain_notify.notify_waiters();
    }

    pub(crate) async fn handle_forward_tsn_for_ordered(
        &self,
        ssn: u16,
    ) -> Vec<(Bytes, PayloadProtocolIdentifier)> {
        if self.unordered.load(Ordering::SeqCst) {
            return vec![];
        }

        let mut complete = vec![];
        let mut reassembly_queue = self.reassembly_queue.lock().await;
        reassembly_queue.forward_tsn_for_ordered(ssn);
        while let Ok(assembled) = reassembly_queue.read() {
            complete.push(assembled);
        }
        complete
    }

    pub(crate) async fn handle_forward_tsn_for_unordered(
        &self,
        new_cumulative_tsn: u32,
    ) -> Vec<(Bytes, PayloadProtocolIdentifier)> {
        if !self.unordered.load(Ordering::SeqCst) {
            return vec![];
        }

        let mut complete = vec![];
        let mut reassembly_queue = self.reassembly_queue.lock().await;
        reassembly_queue.forward_tsn_for_unordered(new_cumulative_tsn);
        while let Ok(assembled) = reassembly_queue.read() {
            complete.push(assembled);
        }
        complete
    }

    /// Called from the association when a SACK releases outbound bytes of
    /// this stream.
    pub(crate) fn on_buffer_released(&self, n_bytes_released: i64) {
        if n_bytes_released <= 0 {
            return;
        }

        let from_amount = self.buffered_amount.load(Ordering::SeqCst);
        let new_amount = if from_amount < n_bytes_released as usize {
            self.buffered_amount.store(0, Ordering::SeqCst);
            log::error!(
                "[{}] released buffer size {} should be <= {}",
                self.name,
                n_bytes_released,
                from_amount,
            );
            0
        } else {
            self.buffered_amount
                .fetch_sub(n_bytes_released as usize, Ordering::SeqCst);
            from_amount - n_bytes_released as usize
        };

        log::trace!("[{}] bufferedAmount = {}", self.name, new_amount);

        if new_amount == 0 {
            self.drain_notify.notify_waiters();
        }
    }

    pub(crate) async fn get_num_bytes_in_reassembly_queue(&self) -> usize {
        let reassembly_queue = self.reassembly_queue.lock().await;
        reassembly_queue.get_num_bytes()
    }

    fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn awake_write_loop(&self) {
        let _ = self.awake_write_loop_ch.try_send(());
    }

    async fn send_reset_request(&self) -> Result<()> {
        if self.get_state() != AssociationState::Established {
            return Err(Error::ErrNotEstablished);
        }

        // A DATA chunk with empty user data marks the end of this stream;
        // the write loop turns it into an outgoing reset request.
        let c = ChunkData {
            stream_identifier: self.stream_identifier,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::new(),
            ..Default::default()
        };

        self.pending_queue.push(c).await;
        self.awake_write_loop();
        Ok(())
    }
}
