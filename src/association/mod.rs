
mod association_internal;
mod association_stats;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use util::Conn;

use crate::chunk::chunk_data::PayloadProtocolIdentifier;
use crate::chunk::chunk_init::ChunkInit;
use crate::dcep::{ChannelType, DataChannelOpen, DcepMessage, CHANNEL_PRIORITY_NORMAL};
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::timer::ack_timer::{AckTimer, ACK_INTERVAL};
use crate::timer::rtx_timer::{RtxTimer, MAX_INIT_RETRANS};

use association_internal::*;

pub(crate) const RECEIVE_MTU: usize = 8192;
/// MTU for inbound packets (from the lower transport).
pub(crate) const INITIAL_MTU: u32 = 1228;
pub(crate) const INITIAL_RECV_BUF_SIZE: u32 = 1024 * 1024;
pub(crate) const COMMON_HEADER_SIZE: u32 = 12;
pub(crate) const DATA_CHUNK_HEADER_SIZE: u32 = 16;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65536;
/// How long an issued state cookie stays valid.
pub(crate) const DEFAULT_COOKIE_LIFETIME: Duration = Duration::from_secs(60);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) enum AssociationState {
    #[default]
    Closed = 0,
    CookieWait = 1,
    CookieEchoed = 2,
    Established = 3,
    ShutdownAckSent = 4,
    ShutdownPending = 5,
    ShutdownReceived = 6,
    ShutdownSent = 7,
}

impl From<u8> for AssociationState {
    fn from(v: u8) -> AssociationState {
        match v {
            1 => AssociationState::CookieWait,
            2 => AssociationState::CookieEchoed,
            3 => AssociationState::Established,
            4 => AssociationState::ShutdownAckSent,
            5 => AssociationState::ShutdownPending,
            6 => AssociationState::ShutdownReceived,
            7 => AssociationState::ShutdownSent,
            _ => AssociationState::Closed,
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownSent => "ShutdownSent",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{s}")
    }
}

/// Retransmission timer IDs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) enum RtxTimerId {
    #[default]
    T1Init,
    T1Cookie,
    T2Shutdown,
    T3Rtx,
    Reconfig,
}

impl fmt::Display for RtxTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RtxTimerId::T1Init => "T1Init",
            RtxTimerId::T1Cookie => "T1Cookie",
            RtxTimerId::T2Shutdown => "T2Shutdown",
            RtxTimerId::T3Rtx => "T3Rtx",
            RtxTimerId::Reconfig => "Reconfig",
        };
        write!(f, "{s}")
    }
}

/// Ack mode, for testing the delayed-ack machinery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) enum AckMode {
    #[default]
    Normal,
    NoDelay,
    AlwaysDelay,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckMode::Normal => "Normal",
            AckMode::NoDelay => "NoDelay",
            AckMode::AlwaysDelay => "AlwaysDelay",
        };
        write!(f, "{s}")
    }
}

/// Ack transmission state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) enum AckState {
    /// Ack timer is off.
    #[default]
    Idle,
    /// Will send ack immediately.
    Immediate,
    /// Ack timer is on, the ack is being delayed.
    Delay,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckState::Idle => "Idle",
            AckState::Immediate => "Immediate",
            AckState::Delay => "Delay",
        };
        write!(f, "{s}")
    }
}

/// Receives association lifecycle events and inbound stream
/// announcements. Callbacks run outside the engine lock.
#[async_trait]
pub trait AssociationListener {
    /// The handshake completed; the association reached ESTABLISHED.
    async fn on_associated(&mut self, _association: Arc<Association>) {}

    /// The association was torn down, gracefully or not.
    async fn on_disassociated(&mut self, _reason: String) {}

    /// The peer opened a stream whose first message was not DCEP.
    async fn on_raw_stream(&mut self, _stream: Arc<Stream>) {}

    /// The peer opened a data channel; DATA_CHANNEL_OPEN has been parsed
    /// and acknowledged, and the channel's reliability parameters are
    /// already applied to the stream.
    async fn on_dcep_stream(
        &mut self,
        _stream: Arc<Stream>,
        _label: String,
        _channel_type: ChannelType,
    ) {
    }
}

pub(crate) type ListenerHolder = Arc<Mutex<Option<Box<dyn AssociationListener + Send + Sync>>>>;

/// Arguments for establishing an association.
pub struct Config {
    pub net_conn: Arc<dyn Conn + Send + Sync>,
    /// 0 selects the default of 1 MiB.
    pub max_receive_buffer_size: u32,
    /// 0 selects the default of 64 KiB.
    pub max_message_size: u32,
    /// Delayed-SACK interval; `Duration::ZERO` selects the RFC 4960
    /// default of 200 ms.
    pub ack_interval: Duration,
    /// Retransmission limit for the T3-rtx timer; 0 retries forever.
    pub max_retransmits: usize,
    /// Validity window of issued state cookies; `Duration::ZERO` selects
    /// the default of 60 s.
    pub cookie_lifetime: Duration,
    pub listener: Option<Box<dyn AssociationListener + Send + Sync>>,
    pub name: String,
}

/// An SCTP association over one transport connection (RFC 4960
/// section 13.2, the TCB). Owns the read and write loops; streams are
/// announced through the [`AssociationListener`].
pub struct Association {
    name: String,
    state: Arc<AtomicU8>,
    max_message_size: Arc<AtomicU32>,
    inflight_queue_length: Arc<AtomicUsize>,
    will_send_shutdown: Arc<AtomicBool>,
    awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    close_loop_ch_rx: Mutex<broadcast::Receiver<()>>,
    net_conn: Arc<dyn Conn + Send + Sync>,
    bytes_received: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicUsize>,
    listener: ListenerHolder,

    pub(crate) association_internal: Arc<Mutex<AssociationInternal>>,
}

impl Association {
    /// Waits for a peer-initiated handshake over the conn.
    pub async fn server(config: Config) -> Result<Arc<Self>> {
        Association::new(config, false).await
    }

    /// Initiates the handshake over the conn (the "associate" operation).
    pub async fn client(config: Config) -> Result<Arc<Self>> {
        Association::new(config, true).await
    }

    async fn new(mut config: Config, is_client: bool) -> Result<Arc<Self>> {
        let net_conn = Arc::clone(&config.net_conn);
        let listener: ListenerHolder = Arc::new(Mutex::new(config.listener.take()));
        let ack_interval = if config.ack_interval.is_zero() {
            ACK_INTERVAL
        } else {
            config.ack_interval
        };
        let max_retransmits = config.max_retransmits;

        let (awake_write_loop_ch_tx, awake_write_loop_ch_rx) = mpsc::channel(1);
        let (handshake_completed_ch_tx, mut handshake_completed_ch_rx) = mpsc::channel(1);
        let (close_loop_ch_tx, close_loop_ch_rx) = broadcast::channel(1);
        let (close_loop_ch_rx1, close_loop_ch_rx2) =
            (close_loop_ch_tx.subscribe(), close_loop_ch_tx.subscribe());
        let awake_write_loop_ch = Arc::new(awake_write_loop_ch_tx);

        let ai = AssociationInternal::new(
            config,
            close_loop_ch_tx,
            handshake_completed_ch_tx,
            Arc::clone(&awake_write_loop_ch),
            Arc::clone(&listener),
        );

        let bytes_received = Arc::new(AtomicUsize::new(0));
        let bytes_sent = Arc::new(AtomicUsize::new(0));
        let name = ai.name.clone();
        let state = Arc::clone(&ai.state);
        let max_message_size = Arc::clone(&ai.max_message_size);
        let inflight_queue_length = Arc::clone(&ai.inflight_queue_length);
        let will_send_shutdown = Arc::clone(&ai.will_send_shutdown);

        let mut init = ChunkInit {
            initial_tsn: ai.my_next_tsn,
            num_outbound_streams: ai.my_max_num_outbound_streams,
            num_inbound_streams: ai.my_max_num_inbound_streams,
            initiate_tag: ai.my_verification_tag,
            advertised_receiver_window_credit: ai.max_receive_buffer_size,
            ..Default::default()
        };
        init.set_supported_extensions();

        let association_internal = Arc::new(Mutex::new(ai));
        {
            let weak = Arc::downgrade(&association_internal);

            let mut ai = association_internal.lock().await;
            ai.t1init = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Init,
                MAX_INIT_RETRANS,
            ));
            ai.t1cookie = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Cookie,
                MAX_INIT_RETRANS,
            ));
            ai.t2shutdown = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T2Shutdown,
                max_retransmits,
            ));
            ai.t3rtx = Some(RtxTimer::new(weak.clone(), RtxTimerId::T3Rtx, max_retransmits));
            ai.treconfig = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::Reconfig,
                max_retransmits,
            ));
            ai.ack_timer = Some(AckTimer::new(weak, ack_interval));
        }

        {
            let name = name.clone();
            let bytes_received = Arc::clone(&bytes_received);
            let net_conn = Arc::clone(&net_conn);
            let association_internal = Arc::clone(&association_internal);
            tokio::spawn(async move {
                Association::read_loop(
                    name,
                    bytes_received,
                    net_conn,
                    close_loop_ch_rx1,
                    association_internal,
                )
                .await;
            });
        }

        {
            let name = name.clone();
            let bytes_sent = Arc::clone(&bytes_sent);
            let net_conn = Arc::clone(&net_conn);
            let association_internal = Arc::clone(&association_internal);
            tokio::spawn(async move {
                Association::write_loop(
                    name,
                    bytes_sent,
                    net_conn,
                    close_loop_ch_rx2,
                    association_internal,
                    awake_write_loop_ch_rx,
                )
                .await;
            });
        }

        if is_client {
            let mut ai = association_internal.lock().await;
            ai.set_state(AssociationState::CookieWait);
            ai.stored_init = Some(init);
            ai.send_init()?;
            let rto = ai.rto_mgr.get_rto();
            if let Some(t1init) = &ai.t1init {
                t1init.start(rto).await;
            }
        }

        let a = Arc::new(Association {
            name,
            state,
            max_message_size,
            inflight_queue_length,
            will_send_shutdown,
            awake_write_loop_ch,
            close_loop_ch_rx: Mutex::new(close_loop_ch_rx),
            net_conn,
            bytes_received,
            bytes_sent,
            listener: Arc::clone(&listener),
            association_internal,
        });

        match handshake_completed_ch_rx.recv().await {
            Some(None) => {
                let listener = Arc::clone(&a.listener);
                let a2 = Arc::clone(&a);
                tokio::spawn(async move {
                    let mut listener = listener.lock().await;
                    if let Some(listener) = listener.as_mut() {
                        listener.on_associated(a2).await;
                    }
                });
                Ok(a)
            }
            Some(Some(err)) => Err(err),
            None => Err(Error::ErrAssociationClosedBeforeConn),
        }
    }

    async fn read_loop(
        name: String,
        bytes_received: Arc<AtomicUsize>,
        net_conn: Arc<dyn Conn + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        association_internal: Arc<Mutex<AssociationInternal>>,
    ) {
        log::debug!("[{name}] read_loop entered");

        let mut buffer = vec![0u8; RECEIVE_MTU];
        let mut reason = String::from("connection closed");
        let mut done = false;
        let mut n;
        while !done {
            tokio::select! {
                _ = close_loop_ch.recv() => break,
                result = net_conn.recv(&mut buffer) => {
                    match result {
                        Ok(m) => {
                            n = m;
                        }
                        Err(err) => {
                            log::warn!("[{name}] failed to read packets on net_conn: {err}");
                            break;
                        }
                    }
                }
            };

            // Copy into a fresh buffer: the user data travels into the
            // reassembly queue without further copies.
            let inbound = Bytes::from(buffer[..n].to_vec());
            bytes_received.fetch_add(n, Ordering::SeqCst);

            {
                let mut ai = association_internal.lock().await;
                if let Err(err) = ai.handle_inbound(&inbound).await {
                    log::warn!("[{name}] failed to handle_inbound: {err:?}");
                    reason = err.to_string();
                    done = true;
                }
            }
        }

        {
            let mut ai = association_internal.lock().await;
            if let Err(err) = ai.close_with_reason(reason).await {
                log::warn!("[{name}] failed to close association: {err:?}");
            }
        }

        log::debug!("[{name}] read_loop exited");
    }

    async fn write_loop(
        name: String,
        bytes_sent: Arc<AtomicUsize>,
        net_conn: Arc<dyn Conn + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        association_internal: Arc<Mutex<AssociationInternal>>,
        mut awake_write_loop_ch: mpsc::Receiver<()>,
    ) {
        log::debug!("[{name}] write_loop entered");
        let done = Arc::new(AtomicBool::new(false));
        let name = Arc::new(name);

        let limit = {
            #[cfg(test)]
            {
                1
            }
            #[cfg(not(test))]
            {
                8
            }
        };

        let sem = Arc::new(Semaphore::new(limit));
        while !done.load(Ordering::Relaxed) {
            let (packets, continue_loop) = {
                let mut ai = association_internal.lock().await;
                ai.gather_outbound().await
            };

            // Serialization and sending happen on a separate task so the
            // read loop can take the engine lock in the meantime.
            let net_conn = Arc::clone(&net_conn);
            let bytes_sent = Arc::clone(&bytes_sent);
            let name2 = Arc::clone(&name);
            let done2 = Arc::clone(&done);
            let sem = Arc::clone(&sem);
            if sem.acquire().await.map(|p| p.forget()).is_err() {
                break;
            }
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(16 * 1024);
                for raw in packets {
                    buf.clear();
                    if let Err(err) = raw.marshal_to(&mut buf) {
                        log::warn!("[{name2}] failed to serialize a packet: {err:?}");
                    } else if let Err(err) = net_conn.send(buf.as_ref()).await {
                        log::warn!("[{name2}] failed to write packets on net_conn: {err}");
                        done2.store(true, Ordering::Relaxed)
                    } else {
                        bytes_sent.fetch_add(buf.len(), Ordering::SeqCst);
                    }
                }
                sem.add_permits(1);
            });

            if !continue_loop {
                break;
            }

            tokio::select! {
                _ = awake_write_loop_ch.recv() => {}
                _ = close_loop_ch.recv() => {
                    done.store(true, Ordering::Relaxed);
                }
            };
        }

        {
            let mut ai = association_internal.lock().await;
            if let Err(err) = ai.close().await {
                log::warn!("[{name}] failed to close association: {err:?}");
            }
        }

        log::debug!("[{name}] write_loop exited");
    }

    /// Initiates the graceful shutdown sequence and blocks until the
    /// association is fully closed.
    pub async fn shutdown(&self) -> Result<()> {
        log::debug!("[{}] shutting down association..", self.name);

        let state = self.get_state();
        if state != AssociationState::Established {
            return Err(Error::ErrNotEstablished);
        }

        self.set_state(AssociationState::ShutdownPending);

        if self.inflight_queue_length.load(Ordering::SeqCst) == 0 {
            // no more outstanding, send SHUTDOWN now
            self.will_send_shutdown.store(true, Ordering::SeqCst);
            let _ = self.awake_write_loop_ch.try_send(());
            self.set_state(AssociationState::ShutdownSent);
        }

        {
            let mut close_loop_ch_rx = self.close_loop_ch_rx.lock().await;
            let _ = close_loop_ch_rx.recv().await;
        }

        Ok(())
    }

    /// Sends an ABORT with a User-Initiated Abort cause and tears the
    /// association down immediately.
    pub async fn abort(&self, reason: &str) {
        log::debug!("[{}] aborting association: {}", self.name, reason);

        let packet = {
            let ai = self.association_internal.lock().await;
            ai.create_abort_packet(reason)
        };
        if let Ok(raw) = packet.marshal() {
            let _ = self.net_conn.send(&raw).await;
        }

        let mut ai = self.association_internal.lock().await;
        let _ = ai
            .close_with_reason(format!("local abort: {reason}"))
            .await;
    }

    /// Ends the association and cleans up without the shutdown sequence.
    pub async fn close(&self) -> Result<()> {
        log::debug!("[{}] closing association..", self.name);

        let _ = self.net_conn.close().await;

        let mut ai = self.association_internal.lock().await;
        ai.close().await
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Opens a plain (non-DCEP) stream.
    pub async fn open_stream(&self, stream_identifier: u16) -> Result<Arc<Stream>> {
        let mut ai = self.association_internal.lock().await;
        ai.open_stream(stream_identifier)
    }

    /// Opens a data channel: opens the stream and sends DATA_CHANNEL_OPEN
    /// on it. The channel is reliable and ordered unless the peer
    /// renegotiates.
    pub async fn open_dcep_stream(
        &self,
        stream_identifier: u16,
        label: &str,
    ) -> Result<Arc<Stream>> {
        let s = self.open_stream(stream_identifier).await?;

        let open = DcepMessage::Open(DataChannelOpen {
            channel_type: ChannelType::Reliable,
            priority: CHANNEL_PRIORITY_NORMAL,
            reliability_parameter: 0,
            label: Bytes::copy_from_slice(label.as_bytes()),
            protocol: Bytes::new(),
        });
        s.send_with_ppi(open.marshal(), PayloadProtocolIdentifier::Dcep)
            .await?;

        Ok(s)
    }

    /// The maximum message size you can send.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size.load(Ordering::SeqCst)
    }

    pub fn set_max_message_size(&self, max_message_size: u32) {
        self.max_message_size
            .store(max_message_size, Ordering::SeqCst);
    }

    fn set_state(&self, new_state: AssociationState) {
        let old_state = AssociationState::from(self.state.swap(new_state as u8, Ordering::SeqCst));
        if new_state != old_state {
            log::debug!(
                "[{}] state change: '{}' => '{}'",
                self.name,
                old_state,
                new_state,
            );
        }
    }

    fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }
}
