use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use super::*;

use crate::chunk::chunk_abort::ChunkAbort;
use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_data::ChunkData;
use crate::chunk::chunk_error::ChunkError;
use crate::chunk::chunk_forward_tsn::{ChunkForwardTsn, ChunkForwardTsnStream};
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_heartbeat_ack::ChunkHeartbeatAck;
use crate::chunk::chunk_reconfig::ChunkReconfig;
use crate::chunk::chunk_sack::ChunkSack;
use crate::chunk::chunk_shutdown::ChunkShutdown;
use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;
use crate::chunk::chunk_shutdown_complete::ChunkShutdownComplete;
use crate::chunk::chunk_type::{UnknownChunkAction, CT_FORWARD_TSN};
use crate::chunk::chunk_unknown::ChunkUnknown;
use crate::chunk::Chunk;
use crate::error_cause::{ErrorCause, STALE_COOKIE_ERROR, UNRECOGNIZED_CHUNK_TYPE};
use crate::packet::Packet;
use crate::param::param_add_streams::ParamAddStreams;
use crate::param::param_heartbeat_info::ParamHeartbeatInfo;
use crate::param::param_incoming_reset_request::ParamIncomingResetRequest;
use crate::param::param_outgoing_reset_request::ParamOutgoingResetRequest;
use crate::param::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use crate::param::param_ssn_tsn_reset_request::ParamSsnTsnResetRequest;
use crate::param::param_state_cookie::{unix_time_ms, ParamStateCookie};
use crate::param::param_supported_extensions::ParamSupportedExtensions;
use crate::param::param_unknown::ParamUnknown;
use crate::param::param_unrecognized::ParamUnrecognized;
use crate::param::Param;
use crate::queue::control_queue::ControlQueue;
use crate::queue::payload_queue::PayloadQueue;
use crate::queue::pending_queue::PendingQueue;
use crate::stream::ReliabilityType;
use crate::timer::ack_timer::AckTimerObserver;
use crate::timer::rtx_timer::{RtoManager, RtxTimerObserver};
use crate::util::{sna16lt, sna32gt, sna32gte, sna32lt, sna32lte};

use super::association_stats::AssociationStats;
use rand::random;

/// A reconfiguration request parameter, unified so requests of every kind
/// share one sequencing path (RFC 6525 section 5.1).
#[derive(Debug, Clone)]
enum ReconfigRequest {
    OutgoingReset(ParamOutgoingResetRequest),
    IncomingReset(ParamIncomingResetRequest),
    SsnTsnReset(ParamSsnTsnResetRequest),
    AddStreams(ParamAddStreams),
}

impl ReconfigRequest {
    fn request_sequence_number(&self) -> u32 {
        match self {
            ReconfigRequest::OutgoingReset(p) => p.request_sequence_number,
            ReconfigRequest::IncomingReset(p) => p.request_sequence_number,
            ReconfigRequest::SsnTsnReset(p) => p.request_sequence_number,
            ReconfigRequest::AddStreams(p) => p.request_sequence_number,
        }
    }
}

/// The association engine. Every handler here runs under the one lock
/// shared by the read loop, the write loop and the timers.
pub(crate) struct AssociationInternal {
    pub(crate) name: String,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) max_message_size: Arc<AtomicU32>,
    pub(crate) inflight_queue_length: Arc<AtomicUsize>,
    pub(crate) will_send_shutdown: Arc<AtomicBool>,
    awake_write_loop_ch: Arc<mpsc::Sender<()>>,

    peer_verification_tag: u32,
    pub(crate) my_verification_tag: u32,

    pub(crate) my_next_tsn: u32,
    peer_last_tsn: u32,
    /// The lowest TSN still eligible for an RTT measurement (Karn's
    /// algorithm).
    min_tsn2measure_rtt: u32,
    will_send_forward_tsn: bool,
    will_retransmit_fast: bool,
    will_retransmit_reconfig: bool,

    will_send_shutdown_ack: bool,
    will_send_shutdown_complete: bool,

    // Reconfiguration (RFC 6525)
    my_next_rsn: u32,
    /// Our outstanding RECONFIG chunks keyed by request sequence number,
    /// kept for retransmission until the peer responds.
    reconfigs: HashMap<u32, ChunkReconfig>,
    /// Peer outgoing-reset requests answered In Progress, re-evaluated as
    /// the peer's cumulative TSN advances.
    reconfig_requests: HashMap<u32, ParamOutgoingResetRequest>,
    /// The next request sequence number we expect from the peer.
    expected_peer_rsn: u32,
    /// Responses already sent. A retransmitted request gets its original
    /// response back verbatim.
    cached_reconfig_responses: HashMap<u32, ParamReconfigResponse>,
    /// Requests that arrived ahead of sequence, held until the gap fills.
    held_reconfig_requests: HashMap<u32, ReconfigRequest>,

    source_port: u16,
    destination_port: u16,
    pub(crate) my_max_num_inbound_streams: u16,
    pub(crate) my_max_num_outbound_streams: u16,
    my_cookie: Option<ParamStateCookie>,
    cookie_lifetime: Duration,

    payload_queue: PayloadQueue,
    inflight_queue: PayloadQueue,
    pending_queue: Arc<PendingQueue>,
    control_queue: ControlQueue,
    mtu: u32,
    /// Largest DATA chunk payload per fragment.
    max_payload_size: u32,

    cumulative_tsn_ack_point: u32,
    advanced_peer_tsn_ack_point: u32,
    use_forward_tsn: bool,

    // Congestion control (RFC 4960 section 7)
    cwnd: u32,
    rwnd: u32,
    ssthresh: u32,
    partial_bytes_acked: u32,
    in_fast_recovery: bool,
    fast_recover_exit_point: u32,

    pub(crate) rto_mgr: RtoManager,
    pub(crate) t1init: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t1cookie: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t2shutdown: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t3rtx: Option<RtxTimer<AssociationInternal>>,
    pub(crate) treconfig: Option<RtxTimer<AssociationInternal>>,
    pub(crate) ack_timer: Option<AckTimer<AssociationInternal>>,

    pub(crate) max_receive_buffer_size: u32,

    streams: HashMap<u16, Arc<Stream>>,
    /// Inbound streams the listener has not been told about yet. The
    /// first complete message decides between `on_raw_stream` and
    /// `on_dcep_stream`.
    unannounced: HashSet<u16>,
    listener: ListenerHolder,

    close_loop_ch_tx: Option<broadcast::Sender<()>>,
    handshake_completed_ch_tx: Option<mpsc::Sender<Option<Error>>>,

    pub(crate) stored_init: Option<ChunkInit>,
    stored_cookie_echo: Option<ChunkCookieEcho>,

    delayed_ack_triggered: bool,
    immediate_ack_triggered: bool,

    stats: AssociationStats,
    ack_state: AckState,
    pub(crate) ack_mode: AckMode,
}

impl AssociationInternal {
    pub(crate) fn new(
        config: Config,
        close_loop_ch_tx: broadcast::Sender<()>,
        handshake_completed_ch_tx: mpsc::Sender<Option<Error>>,
        awake_write_loop_ch: Arc<mpsc::Sender<()>>,
        listener: ListenerHolder,
    ) -> Self {
        let max_receive_buffer_size = if config.max_receive_buffer_size == 0 {
            INITIAL_RECV_BUF_SIZE
        } else {
            config.max_receive_buffer_size
        };
        let max_message_size = if config.max_message_size == 0 {
            DEFAULT_MAX_MESSAGE_SIZE
        } else {
            config.max_message_size
        };
        let cookie_lifetime = if config.cookie_lifetime.is_zero() {
            DEFAULT_COOKIE_LIFETIME
        } else {
            config.cookie_lifetime
        };
        let inflight_queue_length = Arc::new(AtomicUsize::new(0));

        // the initial TSN is random, but never zero
        let tsn = random::<u32>().max(1);
        let mtu = INITIAL_MTU;
        let cwnd = std::cmp::min(4 * mtu, std::cmp::max(2 * mtu, 4380));

        let a = AssociationInternal {
            name: config.name,
            state: Arc::new(AtomicU8::new(AssociationState::Closed as u8)),
            max_message_size: Arc::new(AtomicU32::new(max_message_size)),
            inflight_queue_length: Arc::clone(&inflight_queue_length),
            will_send_shutdown: Arc::new(AtomicBool::new(false)),
            awake_write_loop_ch,

            peer_verification_tag: 0,
            my_verification_tag: random::<u32>(),

            my_next_tsn: tsn,
            peer_last_tsn: 0,
            min_tsn2measure_rtt: tsn,
            will_send_forward_tsn: false,
            will_retransmit_fast: false,
            will_retransmit_reconfig: false,
            will_send_shutdown_ack: false,
            will_send_shutdown_complete: false,

            // RFC 6525: the initial request sequence number equals the
            // initial TSN
            my_next_rsn: tsn,
            reconfigs: HashMap::new(),
            reconfig_requests: HashMap::new(),
            expected_peer_rsn: 0,
            cached_reconfig_responses: HashMap::new(),
            held_reconfig_requests: HashMap::new(),

            source_port: 0,
            destination_port: 0,
            my_max_num_inbound_streams: u16::MAX,
            my_max_num_outbound_streams: u16::MAX,
            my_cookie: None,
            cookie_lifetime,

            payload_queue: PayloadQueue::new(Arc::new(AtomicUsize::new(0))),
            inflight_queue: PayloadQueue::new(inflight_queue_length),
            pending_queue: Arc::new(PendingQueue::new()),
            control_queue: ControlQueue::new(),
            mtu,
            max_payload_size: mtu - (COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE),

            cumulative_tsn_ack_point: tsn.wrapping_sub(1),
            advanced_peer_tsn_ack_point: tsn.wrapping_sub(1),
            use_forward_tsn: false,

            // RFC 4960 section 7.2.1: initial cwnd
            cwnd,
            rwnd: 0,
            ssthresh: 0,
            partial_bytes_acked: 0,
            in_fast_recovery: false,
            fast_recover_exit_point: 0,

            rto_mgr: RtoManager::new(),
            t1init: None,
            t1cookie: None,
            t2shutdown: None,
            t3rtx: None,
            treconfig: None,
            ack_timer: None,

            max_receive_buffer_size,

            streams: HashMap::new(),
            unannounced: HashSet::new(),
            listener,

            close_loop_ch_tx: Some(close_loop_ch_tx),
            handshake_completed_ch_tx: Some(handshake_completed_ch_tx),

            stored_init: None,
            stored_cookie_echo: None,

            delayed_ack_triggered: false,
            immediate_ack_triggered: false,

            stats: AssociationStats::default(),
            ack_state: AckState::Idle,
            ack_mode: AckMode::Normal,
        };

        log::trace!(
            "[{}] created, cwnd={} initial TSN {}",
            a.name,
            a.cwnd,
            tsn
        );

        a
    }

    pub(crate) fn send_init(&mut self) -> Result<()> {
        if let Some(stored_init) = &self.stored_init {
            log::debug!("[{}] sending INIT", self.name);

            self.source_port = 5000;
            self.destination_port = 5000;

            let outbound = Packet {
                source_port: self.source_port,
                destination_port: self.destination_port,
                // RFC 4960 section 8.5.1: zero on a packet carrying INIT
                verification_tag: self.peer_verification_tag,
                chunks: vec![Box::new(stored_init.clone())],
            };

            self.control_queue.push_back(outbound);
            self.awake_write_loop();
            Ok(())
        } else {
            Err(Error::ErrInitNotStoredToSend)
        }
    }

    fn send_cookie_echo(&mut self) -> Result<()> {
        if let Some(stored_cookie_echo) = &self.stored_cookie_echo {
            log::debug!("[{}] sending COOKIE ECHO", self.name);

            let outbound = Packet {
                source_port: self.source_port,
                destination_port: self.destination_port,
                verification_tag: self.peer_verification_tag,
                chunks: vec![Box::new(stored_cookie_echo.clone())],
            };

            self.control_queue.push_back(outbound);
            self.awake_write_loop();
            Ok(())
        } else {
            Err(Error::ErrCookieEchoNotStoredToSend)
        }
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        self.close_with_reason("association closed".to_owned())
            .await
    }

    pub(crate) async fn close_with_reason(&mut self, reason: String) -> Result<()> {
        if self.get_state() == AssociationState::Closed {
            return Ok(());
        }
        self.set_state(AssociationState::Closed);

        log::debug!("[{}] closing association: {}", self.name, reason);

        self.close_all_timers().await;

        // stop the read and write loops
        if let Some(close_loop_ch_tx) = self.close_loop_ch_tx.take() {
            let _ = close_loop_ch_tx.send(());
        }

        // a handshake still in progress fails now
        self.complete_handshake(Some(Error::ErrAssociationClosed))
            .await;

        for (_, s) in self.streams.drain() {
            s.notify_closed();
        }

        log::debug!("[{}] stats: {}", self.name, self.stats);

        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            let mut listener = listener.lock().await;
            if let Some(listener) = listener.as_mut() {
                listener.on_disassociated(reason).await;
            }
        });

        Ok(())
    }

    async fn close_all_timers(&mut self) {
        if let Some(t1init) = &self.t1init {
            t1init.stop().await;
        }
        if let Some(t1cookie) = &self.t1cookie {
            t1cookie.stop().await;
        }
        if let Some(t2shutdown) = &self.t2shutdown {
            t2shutdown.stop().await;
        }
        if let Some(t3rtx) = &self.t3rtx {
            t3rtx.stop().await;
        }
        if let Some(treconfig) = &self.treconfig {
            treconfig.stop().await;
        }
        if let Some(ack_timer) = &mut self.ack_timer {
            ack_timer.stop();
        }
    }

    async fn complete_handshake(&mut self, result: Option<Error>) {
        // the channel is one-shot; later completions are ignored
        if let Some(handshake_completed_ch_tx) = self.handshake_completed_ch_tx.take() {
            let _ = handshake_completed_ch_tx.send(result).await;
        }
    }

    pub(crate) fn set_state(&self, new_state: AssociationState) {
        let old_state = AssociationState::from(self.state.swap(new_state as u8, Ordering::SeqCst));
        if new_state != old_state {
            log::debug!(
                "[{}] state change: '{}' => '{}'",
                self.name,
                old_state,
                new_state
            );
        }
    }

    pub(crate) fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub(crate) async fn handle_inbound(&mut self, raw: &Bytes) -> Result<()> {
        let p = match Packet::unmarshal(raw) {
            Ok(p) => p,
            Err(err) => {
                log::warn!("[{}] unable to parse SCTP packet {}", self.name, err);
                return Ok(());
            }
        };

        if let Err(err) = p.check_packet() {
            log::warn!("[{}] failed validating packet {}", self.name, err);
            return Ok(());
        }

        self.handle_chunk_start();

        for c in &p.chunks {
            match self.handle_chunk(&p, c).await {
                Ok(()) => {}
                // RFC 4960 section 3.2: stop processing the rest of the
                // packet
                Err(Error::ErrSilentlyDiscard) => break,
                Err(err) => return Err(err),
            }
        }

        self.handle_chunk_end();

        Ok(())
    }

    fn awake_write_loop(&self) {
        let _ = self.awake_write_loop_ch.try_send(());
    }

    fn handle_chunk_start(&mut self) {
        self.delayed_ack_triggered = false;
        self.immediate_ack_triggered = false;
    }

    fn handle_chunk_end(&mut self) {
        if self.immediate_ack_triggered {
            self.ack_state = AckState::Immediate;
            if let Some(ack_timer) = &mut self.ack_timer {
                ack_timer.stop();
            }
            self.awake_write_loop();
        } else if self.delayed_ack_triggered {
            // Will send delayed ack in the next ack timeout
            self.ack_state = AckState::Delay;
            if let Some(ack_timer) = &mut self.ack_timer {
                ack_timer.start();
            }
        }
    }

    #[allow(clippy::borrowed_box)]
    async fn handle_chunk(
        &mut self,
        p: &Packet,
        chunk: &Box<dyn Chunk + Send + Sync>,
    ) -> Result<()> {
        if let Err(err) = chunk.check() {
            log::error!("[{}] failed validating chunk: {:?}", self.name, err);
            return Ok(());
        }

        let chunk_any = chunk.as_any();
        let packets = if let Some(c) = chunk_any.downcast_ref::<ChunkInit>() {
            if c.is_ack {
                self.handle_init_ack(p, c).await?
            } else {
                self.handle_init(p, c)?
            }
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkAbort>() {
            let mut err_str = String::new();
            for e in &c.error_causes {
                err_str += &format!("({e})");
            }
            return Err(Error::ErrAbortChunk(err_str));
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkError>() {
            self.handle_error(c).await?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkHeartbeat>() {
            self.handle_heartbeat(c)?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkCookieEcho>() {
            self.handle_cookie_echo(c).await?
        } else if chunk_any.downcast_ref::<ChunkCookieAck>().is_some() {
            self.handle_cookie_ack().await?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkData>() {
            self.handle_data(c).await?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkSack>() {
            self.handle_sack(c).await?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkReconfig>() {
            self.handle_reconfig(c).await?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkForwardTsn>() {
            self.handle_forward_tsn(c).await?
        } else if chunk_any.downcast_ref::<ChunkShutdown>().is_some() {
            self.handle_shutdown()?
        } else if chunk_any.downcast_ref::<ChunkShutdownAck>().is_some() {
            self.handle_shutdown_ack().await?
        } else if chunk_any.downcast_ref::<ChunkShutdownComplete>().is_some() {
            self.handle_shutdown_complete().await?
        } else if let Some(c) = chunk_any.downcast_ref::<ChunkUnknown>() {
            self.handle_unknown_chunk(c)?
        } else {
            return Err(Error::ErrChunkTypeUnhandled);
        };

        if !packets.is_empty() {
            let mut buf: VecDeque<_> = packets.into_iter().collect();
            self.control_queue.append(&mut buf);
            self.awake_write_loop();
        }

        Ok(())
    }

    /// The two highest bits of an unrecognized chunk type encode whether
    /// to stop or skip, and whether to report (RFC 4960 section 3.2).
    fn handle_unknown_chunk(&mut self, c: &ChunkUnknown) -> Result<Vec<Packet>> {
        let typ = c.header().typ;
        let action = typ.unknown_action();
        log::warn!(
            "[{}] unrecognized chunk type {} ({:?})",
            self.name,
            typ.0,
            action
        );

        let mut reply = vec![];
        if action == UnknownChunkAction::DiscardPacketAndReport
            || action == UnknownChunkAction::SkipAndReport
        {
            let cause = ErrorCause {
                code: UNRECOGNIZED_CHUNK_TYPE,
                raw: c.raw_chunk()?,
            };
            reply.push(self.create_packet(vec![Box::new(ChunkError {
                error_causes: vec![cause],
            })]));
        }

        match action {
            UnknownChunkAction::Skip | UnknownChunkAction::SkipAndReport => Ok(reply),
            UnknownChunkAction::DiscardPacket | UnknownChunkAction::DiscardPacketAndReport => {
                // the report still goes out; only the remaining chunks of
                // this packet are dropped
                if !reply.is_empty() {
                    let mut buf: VecDeque<_> = reply.into_iter().collect();
                    self.control_queue.append(&mut buf);
                    self.awake_write_loop();
                }
                Err(Error::ErrSilentlyDiscard)
            }
        }
    }

    fn handle_init(&mut self, p: &Packet, i: &ChunkInit) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] chunkInit received in state '{}'", self.name, state);

        // RFC 4960 section 5.2.1 and 5.2.2: only the handshake states may
        // take a fresh INIT here
        if state != AssociationState::Closed
            && state != AssociationState::CookieWait
            && state != AssociationState::CookieEchoed
        {
            return Err(Error::ErrChunkInState);
        }

        self.my_max_num_inbound_streams =
            std::cmp::min(i.num_inbound_streams, self.my_max_num_inbound_streams);
        self.my_max_num_outbound_streams =
            std::cmp::min(i.num_outbound_streams, self.my_max_num_outbound_streams);
        self.peer_verification_tag = i.initiate_tag;
        self.source_port = p.destination_port;
        self.destination_port = p.source_port;

        // RFC 4960 13.2: the last TSN received in sequence starts one
        // below the peer's initial TSN
        self.peer_last_tsn = i.initial_tsn.wrapping_sub(1);
        // RFC 6525: the peer's first request sequence number equals its
        // initial TSN
        self.expected_peer_rsn = i.initial_tsn;

        for param in &i.params {
            if let Some(v) = param.as_any().downcast_ref::<ParamSupportedExtensions>() {
                for t in &v.chunk_types {
                    if *t == CT_FORWARD_TSN.0 {
                        log::debug!("[{}] use ForwardTSN (on init)", self.name);
                        self.use_forward_tsn = true;
                    }
                }
            }
        }
        if !self.use_forward_tsn {
            log::warn!("[{}] not using ForwardTSN (on init)", self.name);
        }

        let mut outbound = Packet {
            verification_tag: self.peer_verification_tag,
            source_port: self.source_port,
            destination_port: self.destination_port,
            ..Default::default()
        };

        let mut init_ack = ChunkInit {
            is_ack: true,
            initial_tsn: self.my_next_tsn,
            num_outbound_streams: self.my_max_num_outbound_streams,
            num_inbound_streams: self.my_max_num_inbound_streams,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.max_receive_buffer_size,
            ..Default::default()
        };

        // the cookie binds both verification tags and carries its issue
        // time, so a replayed or cross-wired COOKIE ECHO is detectable
        let cookie = ParamStateCookie::new(self.my_verification_tag, self.peer_verification_tag);
        self.my_cookie = Some(cookie.clone());
        init_ack.params = vec![Box::new(cookie)];

        // RFC 4960 section 3.2.1: report parameters whose type asks for it
        for param in &i.params {
            if param.as_any().downcast_ref::<ParamUnknown>().is_some()
                && param.header().typ.report_if_unrecognized()
            {
                init_ack
                    .params
                    .push(Box::new(ParamUnrecognized::wrap(param.clone_to())));
            }
        }

        init_ack.set_supported_extensions();

        outbound.chunks = vec![Box::new(init_ack)];

        Ok(vec![outbound])
    }

    async fn handle_init_ack(&mut self, p: &Packet, i: &ChunkInit) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] chunkInitAck received in state '{}'", self.name, state);
        if state != AssociationState::CookieWait {
            // RFC 4960 section 5.2.3: discard
            return Ok(vec![]);
        }

        if self.source_port != p.destination_port || self.destination_port != p.source_port {
            log::warn!("[{}] handle_init_ack: port mismatch", self.name);
            return Ok(vec![]);
        }

        self.my_max_num_inbound_streams =
            std::cmp::min(i.num_inbound_streams, self.my_max_num_inbound_streams);
        self.my_max_num_outbound_streams =
            std::cmp::min(i.num_outbound_streams, self.my_max_num_outbound_streams);
        self.peer_verification_tag = i.initiate_tag;
        self.peer_last_tsn = i.initial_tsn.wrapping_sub(1);
        self.expected_peer_rsn = i.initial_tsn;

        self.rwnd = i.advertised_receiver_window_credit;
        log::debug!("[{}] initial rwnd={}", self.name, self.rwnd);

        // RFC 4960 7.2.1: the initial ssthresh MAY be arbitrarily high;
        // this implementation uses the peer's a_rwnd
        self.ssthresh = self.rwnd;
        log::trace!(
            "[{}] updated cwnd={} ssthresh={} inflight={} (INI)",
            self.name,
            self.cwnd,
            self.ssthresh,
            self.inflight_queue.get_num_bytes()
        );

        if let Some(t1init) = &self.t1init {
            t1init.stop().await;
        }
        self.stored_init = None;

        let mut cookie_param: Option<&ParamStateCookie> = None;
        for param in &i.params {
            if let Some(v) = param.as_any().downcast_ref::<ParamStateCookie>() {
                cookie_param = Some(v);
            } else if let Some(v) = param.as_any().downcast_ref::<ParamSupportedExtensions>() {
                for t in &v.chunk_types {
                    if *t == CT_FORWARD_TSN.0 {
                        log::debug!("[{}] use ForwardTSN (on initAck)", self.name);
                        self.use_forward_tsn = true;
                    }
                }
            }
        }
        if !self.use_forward_tsn {
            log::warn!("[{}] not using ForwardTSN (on initAck)", self.name);
        }

        if let Some(cookie_param) = cookie_param {
            self.stored_cookie_echo = Some(ChunkCookieEcho {
                cookie: cookie_param.cookie.clone(),
            });

            self.send_cookie_echo()?;

            if let Some(t1cookie) = &self.t1cookie {
                t1cookie.start(self.rto_mgr.get_rto()).await;
            }

            self.set_state(AssociationState::CookieEchoed);
            Ok(vec![])
        } else {
            Err(Error::ErrInitAckNoCookie)
        }
    }

    /// A received ERROR chunk. Most causes are only logged, but a Stale
    /// Cookie Error during the handshake fails the pending connect.
    async fn handle_error(&mut self, c: &ChunkError) -> Result<Vec<Packet>> {
        let state = self.get_state();
        for cause in &c.error_causes {
            if cause.code == STALE_COOKIE_ERROR && state == AssociationState::CookieEchoed {
                log::error!("[{}] stale cookie, handshake failed", self.name);
                if let Some(t1cookie) = &self.t1cookie {
                    t1cookie.stop().await;
                }
                self.complete_handshake(Some(Error::ErrStaleCookie)).await;
                return Err(Error::ErrStaleCookie);
            }
            log::warn!("[{}] ERROR cause from the peer: {}", self.name, cause);
        }
        Ok(vec![])
    }

    fn handle_heartbeat(&self, c: &ChunkHeartbeat) -> Result<Vec<Packet>> {
        log::trace!("[{}] chunkHeartbeat", self.name);
        if let Some(p) = c.params.first() {
            if let Some(hbi) = p.as_any().downcast_ref::<ParamHeartbeatInfo>() {
                return Ok(vec![self.create_packet(vec![Box::new(ChunkHeartbeatAck {
                    params: vec![Box::new(ParamHeartbeatInfo {
                        heartbeat_information: hbi.heartbeat_information.clone(),
                    })],
                })])]);
            }
            log::warn!("[{}] heartbeat without heartbeat info param", self.name);
        } else {
            log::warn!("[{}] heartbeat without params", self.name);
        }
        Ok(vec![])
    }

    async fn handle_cookie_echo(&mut self, c: &ChunkCookieEcho) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE ECHO received in state '{}'", self.name, state);

        match state {
            AssociationState::Established => {
                // the peer retransmitted its COOKIE ECHO; ack it again
                let matches = match &self.my_cookie {
                    Some(my_cookie) => my_cookie.cookie == c.cookie,
                    None => false,
                };
                if !matches {
                    return Ok(vec![]);
                }
            }
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {
                let echoed = ParamStateCookie {
                    cookie: c.cookie.clone(),
                };
                let (issued_at, local_tag, peer_tag) = match echoed.decode() {
                    Some(decoded) => decoded,
                    None => {
                        log::debug!("[{}] undecodable state cookie, discarding", self.name);
                        return Ok(vec![]);
                    }
                };

                // the cookie must have been issued by us, for this peer
                if local_tag != self.my_verification_tag
                    || peer_tag != self.peer_verification_tag
                {
                    log::debug!(
                        "[{}] {}: {:?}",
                        self.name,
                        Error::ErrCookieMismatch,
                        echoed.cookie
                    );
                    return Ok(vec![]);
                }

                // RFC 4960 section 5.1.5 rule 3: an expired cookie gets a
                // Stale Cookie Error back
                let age_ms = unix_time_ms().saturating_sub(issued_at);
                let lifetime_ms = self.cookie_lifetime.as_millis() as u64;
                if age_ms > lifetime_ms {
                    log::warn!(
                        "[{}] stale state cookie ({}ms > {}ms)",
                        self.name,
                        age_ms,
                        lifetime_ms
                    );
                    let staleness_us = ((age_ms - lifetime_ms) * 1000).min(u32::MAX as u64) as u32;
                    return Ok(vec![self.create_packet(vec![Box::new(ChunkError {
                        error_causes: vec![ErrorCause::stale_cookie(staleness_us)],
                    })])]);
                }

                if let Some(t1init) = &self.t1init {
                    t1init.stop().await;
                }
                self.stored_init = None;
                if let Some(t1cookie) = &self.t1cookie {
                    t1cookie.stop().await;
                }
                self.stored_cookie_echo = None;

                self.set_state(AssociationState::Established);
                self.complete_handshake(None).await;
            }
            _ => return Ok(vec![]),
        };

        Ok(vec![self.create_packet(vec![Box::new(ChunkCookieAck)])])
    }

    async fn handle_cookie_ack(&mut self) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE ACK received in state '{}'", self.name, state);
        if state != AssociationState::CookieEchoed {
            // RFC 4960 section 5.2.5: discard
            return Ok(vec![]);
        }

        if let Some(t1cookie) = &self.t1cookie {
            t1cookie.stop().await;
        }
        self.stored_cookie_echo = None;

        self.set_state(AssociationState::Established);
        self.complete_handshake(None).await;

        Ok(vec![])
    }

    async fn handle_data(&mut self, d: &ChunkData) -> Result<Vec<Packet>> {
        log::trace!(
            "[{}] DATA: tsn={} immediateSack={} len={}",
            self.name,
            d.tsn,
            d.immediate_sack,
            d.user_data.len()
        );
        self.stats.inc_datas();

        let can_push = self.payload_queue.can_push(d, self.peer_last_tsn);
        let mut stream_handle_data = false;
        if can_push {
            if self.get_my_receiver_window_credit().await > 0 {
                self.payload_queue.push_no_check(d.clone());
                stream_handle_data = true;
            } else if let Some(last_tsn) = self.payload_queue.get_last_tsn_received() {
                // Receive buffer full. A chunk that fills an earlier gap
                // is still taken so the reassembly can make progress.
                if sna32lt(d.tsn, *last_tsn) {
                    log::debug!(
                        "[{}] receive buffer full, but accepted as this is a missing chunk with tsn={} ssn={}",
                        self.name,
                        d.tsn,
                        d.stream_sequence_number
                    );
                    self.payload_queue.push_no_check(d.clone());
                    stream_handle_data = true;
                }
            } else {
                log::debug!("[{}] receive buffer full, dropping DATA", self.name);
            }
        }

        if stream_handle_data {
            let s = self.get_or_create_stream(d.stream_identifier);
            let complete = s.handle_data(d.clone()).await;
            self.dispatch_complete_messages(s, complete);
        }

        self.handle_peer_last_tsn_and_acknowledgement(d.immediate_sack)
            .await
    }

    /// Advances `peer_last_tsn` over chunks now in sequence, re-evaluates
    /// reconfig requests that were waiting on that advance, and schedules
    /// the SACK.
    async fn handle_peer_last_tsn_and_acknowledgement(
        &mut self,
        sack_immediately: bool,
    ) -> Result<Vec<Packet>> {
        let mut reply = vec![];

        while self
            .payload_queue
            .pop(self.peer_last_tsn.wrapping_add(1))
            .is_some()
        {
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);
        }

        if !self.reconfig_requests.is_empty() {
            let rst_reqs: Vec<ParamOutgoingResetRequest> =
                self.reconfig_requests.values().cloned().collect();
            for rst_req in rst_reqs {
                self.retry_outgoing_reset_request(&rst_req, &mut reply)
                    .await?;
            }
        }

        let has_packet_loss = !self.payload_queue.is_empty();
        if has_packet_loss {
            log::trace!(
                "[{}] packetloss: {}",
                self.name,
                self.payload_queue
                    .get_gap_ack_blocks_string(self.peer_last_tsn)
            );
        }

        if (self.ack_state == AckState::Idle
            && !has_packet_loss
            && self.ack_mode == AckMode::Normal)
            || self.ack_mode == AckMode::AlwaysDelay
        {
            if self.ack_state == AckState::Idle {
                self.delayed_ack_triggered = true;
            } else {
                self.immediate_ack_triggered = true;
            }
        } else {
            self.immediate_ack_triggered = true;
        }
        if sack_immediately {
            self.immediate_ack_triggered = true;
        }

        Ok(reply)
    }

    async fn get_my_receiver_window_credit(&self) -> u32 {
        let mut bytes_queued = 0;
        for s in self.streams.values() {
            bytes_queued += s.get_num_bytes_in_reassembly_queue().await as u32;
        }

        self.max_receive_buffer_size.saturating_sub(bytes_queued)
    }

    pub(crate) fn open_stream(&mut self, stream_identifier: u16) -> Result<Arc<Stream>> {
        if self.streams.contains_key(&stream_identifier) {
            return Err(Error::ErrStreamAlreadyExist);
        }
        Ok(self.create_stream(stream_identifier, false))
    }

    fn create_stream(&mut self, stream_identifier: u16, from_peer: bool) -> Arc<Stream> {
        let s = Arc::new(Stream::new(
            format!("{}:{}", stream_identifier, self.name),
            stream_identifier,
            self.max_payload_size,
            Arc::clone(&self.max_message_size),
            Arc::clone(&self.state),
            Arc::clone(&self.awake_write_loop_ch),
            Arc::clone(&self.pending_queue),
        ));
        if from_peer {
            self.unannounced.insert(stream_identifier);
        }
        self.streams.insert(stream_identifier, Arc::clone(&s));
        s
    }

    fn get_or_create_stream(&mut self, stream_identifier: u16) -> Arc<Stream> {
        if let Some(s) = self.streams.get(&stream_identifier) {
            Arc::clone(s)
        } else {
            self.create_stream(stream_identifier, true)
        }
    }

    fn unregister_stream(&mut self, stream_identifier: u16) {
        if let Some(s) = self.streams.remove(&stream_identifier) {
            log::debug!("[{}] unregister stream {}", self.name, stream_identifier);
            self.unannounced.remove(&stream_identifier);
            s.notify_closed();
        }
    }

    /// Routes the complete messages a stream just produced. DCEP control
    /// messages are consumed here; user messages go to the stream
    /// listener. For a peer-opened stream the first message decides which
    /// announcement the association listener receives.
    fn dispatch_complete_messages(
        &mut self,
        s: Arc<Stream>,
        complete: Vec<(Bytes, PayloadProtocolIdentifier)>,
    ) {
        for (data, ppi) in complete {
            if ppi == PayloadProtocolIdentifier::Dcep {
                match DcepMessage::unmarshal(&data) {
                    Ok(DcepMessage::Open(open)) => {
                        let channel_type = open.channel_type;
                        s.set_reliability_params(
                            channel_type.unordered(),
                            channel_type.reliability(),
                            open.reliability_parameter,
                        );
                        self.unannounced.remove(&s.stream_identifier());

                        let label = String::from_utf8_lossy(&open.label).into_owned();
                        log::debug!(
                            "[{}] data channel '{}' opened by the peer on stream {}",
                            self.name,
                            label,
                            s.stream_identifier()
                        );

                        // ack first, then announce
                        let s2 = Arc::clone(&s);
                        let listener = Arc::clone(&self.listener);
                        tokio::spawn(async move {
                            let ack = DcepMessage::Ack.marshal();
                            if let Err(err) = s2
                                .send_with_ppi(ack, PayloadProtocolIdentifier::Dcep)
                                .await
                            {
                                log::warn!(
                                    "[{}] failed to send DATA_CHANNEL_ACK: {:?}",
                                    s2.name,
                                    err
                                );
                            }
                            let mut listener = listener.lock().await;
                            if let Some(listener) = listener.as_mut() {
                                listener.on_dcep_stream(s2, label, channel_type).await;
                            }
                        });
                    }
                    Ok(DcepMessage::Ack) => {
                        log::debug!(
                            "[{}] data channel on stream {} acknowledged",
                            self.name,
                            s.stream_identifier()
                        );
                    }
                    Err(err) => {
                        log::warn!("[{}] failed to parse DCEP message: {:?}", self.name, err);
                    }
                }
            } else {
                if self.unannounced.remove(&s.stream_identifier()) {
                    let s2 = Arc::clone(&s);
                    let listener = Arc::clone(&self.listener);
                    tokio::spawn(async move {
                        let mut listener = listener.lock().await;
                        if let Some(listener) = listener.as_mut() {
                            listener.on_raw_stream(s2).await;
                        }
                    });
                }
                s.deliver(data, ppi);
            }
        }
    }

    async fn process_selective_ack(
        &mut self,
        d: &ChunkSack,
    ) -> Result<(HashMap<u16, i64>, u32)> {
        let mut bytes_acked_per_stream = HashMap::new();

        // New ack point, so pop all acked chunks from the inflight queue
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lte(i, d.cumulative_tsn_ack) {
            if let Some(c) = self.inflight_queue.pop(i) {
                if !c.acked {
                    // RFC 4960 section 6.3.2 R3
                    if let Some(t3rtx) = &self.t3rtx {
                        t3rtx.stop().await;
                    }

                    let n_bytes_acked = c.user_data.len() as i64;
                    *bytes_acked_per_stream
                        .entry(c.stream_identifier)
                        .or_insert(0) += n_bytes_acked;

                    // RFC 4960 section 6.3.1 C5: never measure a
                    // retransmitted chunk (Karn's algorithm)
                    if c.nsent == 1 && sna32gte(c.tsn, self.min_tsn2measure_rtt) {
                        self.min_tsn2measure_rtt = self.my_next_tsn;
                        if let Some(since) = &c.since {
                            let rtt = since.elapsed().as_millis() as u64;
                            let srtt = self.rto_mgr.set_new_rtt(rtt);
                            log::trace!(
                                "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
                                self.name,
                                rtt,
                                srtt,
                                self.rto_mgr.get_rto()
                            );
                        }
                    }

                    if self.in_fast_recovery && c.tsn == self.fast_recover_exit_point {
                        log::debug!("[{}] exit fast-recovery", self.name);
                        self.in_fast_recovery = false;
                    }
                }
            } else {
                return Err(Error::ErrInflightQueueTsnPop);
            }
            i = i.wrapping_add(1);
        }

        let mut htna = d.cumulative_tsn_ack;

        // Mark selectively acked chunks as "acked"
        for g in &d.gap_ack_blocks {
            for i in g.start..=g.end {
                let tsn = d.cumulative_tsn_ack.wrapping_add(i as u32);
                let (is_existing, is_acked, nsent, since, stream_identifier) =
                    match self.inflight_queue.get(tsn) {
                        Some(c) => (true, c.acked, c.nsent, c.since, c.stream_identifier),
                        None => (false, false, 0, None, 0),
                    };
                if !is_existing {
                    return Err(Error::ErrInflightQueueTsnPop);
                }

                if !is_acked {
                    let n_bytes_acked = self.inflight_queue.mark_as_acked(tsn) as i64;
                    *bytes_acked_per_stream
                        .entry(stream_identifier)
                        .or_insert(0) += n_bytes_acked;

                    log::trace!("[{}] tsn={} has been sacked", self.name, tsn);

                    if nsent == 1 && sna32gte(tsn, self.min_tsn2measure_rtt) {
                        self.min_tsn2measure_rtt = self.my_next_tsn;
                        if let Some(since) = &since {
                            let rtt = since.elapsed().as_millis() as u64;
                            let srtt = self.rto_mgr.set_new_rtt(rtt);
                            log::trace!(
                                "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
                                self.name,
                                rtt,
                                srtt,
                                self.rto_mgr.get_rto()
                            );
                        }
                    }

                    if sna32lt(htna, tsn) {
                        htna = tsn;
                    }
                }
            }
        }

        Ok((bytes_acked_per_stream, htna))
    }

    async fn on_cumulative_tsn_ack_point_advanced(&mut self, total_bytes_acked: i64) {
        // RFC 4960 section 6.3.2 R2
        if self.inflight_queue.is_empty() {
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.stop().await;
            }
        }

        // RFC 4960 section 7.2.1 and 7.2.2
        if !self.in_fast_recovery && !self.pending_queue.is_empty() {
            if self.cwnd <= self.ssthresh {
                // Slow start: only grow when the full cwnd is being used
                if self.inflight_queue.get_num_bytes() >= self.cwnd as usize {
                    self.cwnd += std::cmp::min(total_bytes_acked as u32, self.cwnd);
                }
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} acked={} (SS)",
                    self.name,
                    self.cwnd,
                    self.ssthresh,
                    total_bytes_acked
                );
            } else {
                // Congestion avoidance
                self.partial_bytes_acked += total_bytes_acked as u32;
                if self.partial_bytes_acked >= self.cwnd
                    && self.inflight_queue.get_num_bytes() > 0
                {
                    self.partial_bytes_acked -= self.cwnd;
                    self.cwnd += self.mtu;
                    log::trace!(
                        "[{}] updated cwnd={} ssthresh={} acked={} (CA)",
                        self.name,
                        self.cwnd,
                        self.ssthresh,
                        total_bytes_acked
                    );
                }
            }
        }
    }

    fn process_fast_retransmission(
        &mut self,
        cum_tsn_ack_point: u32,
        htna: u32,
        cum_tsn_ack_point_advanced: bool,
    ) {
        // HTNA algorithm, RFC 4960 section 7.2.4
        if !cum_tsn_ack_point_advanced {
            let mut tsn = cum_tsn_ack_point.wrapping_add(1);
            while sna32lt(tsn, htna) {
                let mut entered_fast_recovery = false;
                if let Some(c) = self.inflight_queue.get_mut(tsn) {
                    if !c.acked && !c.abandoned() && c.miss_indicator < 3 {
                        c.miss_indicator += 1;
                        if c.miss_indicator == 3 && !self.in_fast_recovery {
                            entered_fast_recovery = true;
                        }
                    }
                }
                if entered_fast_recovery {
                    // RFC 4960 section 7.2.4: fast retransmit on the third
                    // miss indication
                    self.in_fast_recovery = true;
                    self.fast_recover_exit_point = htna;
                    self.ssthresh = std::cmp::max(self.cwnd / 2, 4 * self.mtu);
                    self.cwnd = self.ssthresh;
                    self.partial_bytes_acked = 0;
                    self.will_retransmit_fast = true;

                    log::trace!(
                        "[{}] updated cwnd={} ssthresh={} inflight={} (FR)",
                        self.name,
                        self.cwnd,
                        self.ssthresh,
                        self.inflight_queue.get_num_bytes()
                    );
                }
                tsn = tsn.wrapping_add(1);
            }
        }

        if self.will_retransmit_fast {
            self.awake_write_loop();
        }
    }

    async fn handle_sack(&mut self, d: &ChunkSack) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::trace!("[{}] {}, state={}", self.name, d, state);
        if state != AssociationState::Established
            && state != AssociationState::ShutdownPending
            && state != AssociationState::ShutdownReceived
        {
            return Ok(vec![]);
        }

        self.stats.inc_sacks();

        if sna32gt(self.cumulative_tsn_ack_point, d.cumulative_tsn_ack) {
            // RFC 4960 section 6.2.1 D: an out-of-order SACK is dropped
            log::debug!(
                "[{}] SACK cumTsnAck={} is older than ackpoint={}",
                self.name,
                d.cumulative_tsn_ack,
                self.cumulative_tsn_ack_point
            );
            return Ok(vec![]);
        }

        let (bytes_acked_per_stream, htna) = self.process_selective_ack(d).await?;

        let mut total_bytes_acked = 0;
        for n_bytes_acked in bytes_acked_per_stream.values() {
            total_bytes_acked += *n_bytes_acked;
        }

        let mut cum_tsn_ack_point_advanced = false;
        if sna32lt(self.cumulative_tsn_ack_point, d.cumulative_tsn_ack) {
            log::trace!(
                "[{}] SACK: cumTSN advanced: {} -> {}",
                self.name,
                self.cumulative_tsn_ack_point,
                d.cumulative_tsn_ack
            );
            self.cumulative_tsn_ack_point = d.cumulative_tsn_ack;
            cum_tsn_ack_point_advanced = true;
            self.on_cumulative_tsn_ack_point_advanced(total_bytes_acked)
                .await;
        }

        for (si, n_bytes_acked) in &bytes_acked_per_stream {
            if let Some(s) = self.streams.get(si) {
                s.on_buffer_released(*n_bytes_acked);
            }
        }

        // RFC 4960 section 6.2.1 D iv
        let bytes_outstanding = self.inflight_queue.get_num_bytes() as u32;
        self.rwnd = d
            .advertised_receiver_window_credit
            .saturating_sub(bytes_outstanding);

        self.process_fast_retransmission(d.cumulative_tsn_ack, htna, cum_tsn_ack_point_advanced);

        if self.use_forward_tsn {
            // RFC 3758 section 3.5 C1
            if sna32lt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            ) {
                self.advanced_peer_tsn_ack_point = self.cumulative_tsn_ack_point;
            }

            // RFC 3758 section 3.5 C2: try to further advance the ack
            // point over abandoned chunks
            let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
            while let Some(c) = self.inflight_queue.get(i) {
                if !c.abandoned() {
                    break;
                }
                self.advanced_peer_tsn_ack_point = i;
                i = i.wrapping_add(1);
            }

            // RFC 3758 section 3.5 C3
            if sna32gt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            ) {
                self.will_send_forward_tsn = true;
            }
            self.awake_write_loop();
        }

        self.postprocess_sack(state, cum_tsn_ack_point_advanced)
            .await;

        Ok(vec![])
    }

    async fn postprocess_sack(
        &mut self,
        state: AssociationState,
        mut should_awake_write_loop: bool,
    ) {
        if !self.inflight_queue.is_empty() {
            // Start the retransmission timer (noop if already running)
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.start(self.rto_mgr.get_rto()).await;
            }
        } else if state == AssociationState::ShutdownPending {
            // No more outstanding, send SHUTDOWN
            should_awake_write_loop = true;
            self.will_send_shutdown.store(true, Ordering::SeqCst);
            self.set_state(AssociationState::ShutdownSent);
        } else if state == AssociationState::ShutdownReceived {
            // No more outstanding, send SHUTDOWN ACK
            should_awake_write_loop = true;
            self.will_send_shutdown_ack = true;
            self.set_state(AssociationState::ShutdownAckSent);
        }

        if should_awake_write_loop {
            self.awake_write_loop();
        }
    }

    fn handle_shutdown(&mut self) -> Result<Vec<Packet>> {
        let state = self.get_state();

        if state == AssociationState::Established {
            if !self.inflight_queue.is_empty() {
                self.set_state(AssociationState::ShutdownReceived);
            } else {
                // No more outstanding, send SHUTDOWN ACK right away
                self.will_send_shutdown_ack = true;
                self.set_state(AssociationState::ShutdownAckSent);
                self.awake_write_loop();
            }
        } else if state == AssociationState::ShutdownSent {
            // RFC 4960 section 9.2: simultaneous shutdown
            self.will_send_shutdown_ack = true;
            self.set_state(AssociationState::ShutdownAckSent);
            self.awake_write_loop();
        }

        Ok(vec![])
    }

    async fn handle_shutdown_ack(&mut self) -> Result<Vec<Packet>> {
        let state = self.get_state();
        if state == AssociationState::ShutdownSent || state == AssociationState::ShutdownAckSent {
            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.stop().await;
            }
            self.will_send_shutdown_complete = true;
            self.awake_write_loop();
        }
        Ok(vec![])
    }

    async fn handle_shutdown_complete(&mut self) -> Result<Vec<Packet>> {
        let state = self.get_state();
        if state == AssociationState::ShutdownAckSent {
            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.stop().await;
            }
            self.close_with_reason("shutdown complete".to_owned())
                .await?;
        }
        Ok(vec![])
    }

    async fn handle_forward_tsn(&mut self, c: &ChunkForwardTsn) -> Result<Vec<Packet>> {
        log::trace!("[{}] FwdTSN: {}", self.name, c);

        if !self.use_forward_tsn {
            log::warn!("[{}] received FwdTSN but not enabled", self.name);
            // Return an Error Chunk with Unrecognized Chunk Type
            let cause = ErrorCause {
                code: UNRECOGNIZED_CHUNK_TYPE,
                raw: c.marshal()?,
            };
            return Ok(vec![self.create_packet(vec![Box::new(ChunkError {
                error_causes: vec![cause],
            })])]);
        }

        // RFC 3758 section 3.6: a FORWARD TSN that does not advance the
        // cumulative TSN only triggers an immediate SACK
        if sna32lte(c.new_cumulative_tsn, self.peer_last_tsn) {
            log::trace!("[{}] FwdTSN: duplicate", self.name);
            self.ack_state = AckState::Immediate;
            if let Some(ack_timer) = &mut self.ack_timer {
                ack_timer.stop();
            }
            self.awake_write_loop();
            return Ok(vec![]);
        }

        while sna32lt(self.peer_last_tsn, c.new_cumulative_tsn) {
            self.payload_queue.pop(self.peer_last_tsn.wrapping_add(1));
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);
        }

        for forwarded in &c.streams {
            if let Some(s) = self.streams.get(&forwarded.identifier).cloned() {
                let complete = s.handle_forward_tsn_for_ordered(forwarded.sequence).await;
                self.dispatch_complete_messages(s, complete);
            }
        }

        // unordered fragments may have been dropped on any stream
        let streams: Vec<Arc<Stream>> = self.streams.values().cloned().collect();
        for s in streams {
            let complete = s
                .handle_forward_tsn_for_unordered(c.new_cumulative_tsn)
                .await;
            self.dispatch_complete_messages(s, complete);
        }

        self.handle_peer_last_tsn_and_acknowledgement(false).await
    }

    async fn handle_reconfig(&mut self, c: &ChunkReconfig) -> Result<Vec<Packet>> {
        log::trace!("[{}] handle_reconfig", self.name);

        let mut pp = vec![];
        if let Some(param_a) = &c.param_a {
            self.handle_reconfig_param(param_a, &mut pp).await?;
        }
        if let Some(param_b) = &c.param_b {
            self.handle_reconfig_param(param_b, &mut pp).await?;
        }
        Ok(pp)
    }

    #[allow(clippy::borrowed_box)]
    async fn handle_reconfig_param(
        &mut self,
        raw: &Box<dyn Param + Send + Sync>,
        reply: &mut Vec<Packet>,
    ) -> Result<()> {
        let any = raw.as_any();

        if let Some(p) = any.downcast_ref::<ParamReconfigResponse>() {
            return self.handle_reconfig_response(p).await;
        }

        let req = if let Some(p) = any.downcast_ref::<ParamOutgoingResetRequest>() {
            ReconfigRequest::OutgoingReset(p.clone())
        } else if let Some(p) = any.downcast_ref::<ParamIncomingResetRequest>() {
            ReconfigRequest::IncomingReset(p.clone())
        } else if let Some(p) = any.downcast_ref::<ParamSsnTsnResetRequest>() {
            ReconfigRequest::SsnTsnReset(p.clone())
        } else if let Some(p) = any.downcast_ref::<ParamAddStreams>() {
            ReconfigRequest::AddStreams(p.clone())
        } else {
            return Err(Error::ErrParamTypeUnhandled {
                typ: raw.header().typ.0,
            });
        };

        self.sequence_reconfig_request(req, reply);
        Ok(())
    }

    /// RFC 6525 section 5.2 sequencing: requests apply exactly once, in
    /// request sequence number order. A retransmitted request gets the
    /// response it got the first time; a request from the future waits.
    fn sequence_reconfig_request(&mut self, req: ReconfigRequest, reply: &mut Vec<Packet>) {
        let mut next = Some(req);
        while let Some(req) = next.take() {
            let rsn = req.request_sequence_number();

            if sna32lt(rsn, self.expected_peer_rsn) {
                // duplicate of an already-processed request
                if let Some(resp) = self.cached_reconfig_responses.get(&rsn) {
                    log::debug!(
                        "[{}] duplicate reconfig request rsn={}, resending cached response",
                        self.name,
                        rsn
                    );
                    reply.push(self.create_reconfig_response_packet(resp.clone()));
                } else {
                    reply.push(self.create_reconfig_response_packet(ParamReconfigResponse {
                        response_sequence_number: rsn,
                        result: ReconfigResult::ErrorBadSequenceNumber,
                    }));
                }
                break;
            }

            if sna32gt(rsn, self.expected_peer_rsn) {
                log::debug!(
                    "[{}] reconfig request rsn={} ahead of expected {}, holding",
                    self.name,
                    rsn,
                    self.expected_peer_rsn
                );
                self.held_reconfig_requests.insert(rsn, req);
                break;
            }

            let result = self.apply_reconfig_request(&req);
            let resp = ParamReconfigResponse {
                response_sequence_number: rsn,
                result,
            };
            self.cached_reconfig_responses.insert(rsn, resp.clone());
            reply.push(self.create_reconfig_response_packet(resp));

            if result == ReconfigResult::InProgress {
                // answered again once the peer's TSN advances far enough
                break;
            }

            self.expected_peer_rsn = self.expected_peer_rsn.wrapping_add(1);
            next = self.held_reconfig_requests.remove(&self.expected_peer_rsn);
        }
    }

    fn apply_reconfig_request(&mut self, req: &ReconfigRequest) -> ReconfigResult {
        match req {
            ReconfigRequest::OutgoingReset(p) => {
                if sna32gt(p.sender_last_tsn, self.peer_last_tsn) {
                    log::debug!(
                        "[{}] resetStream(): senderLastTSN={} > peerLastTSN={}",
                        self.name,
                        p.sender_last_tsn,
                        self.peer_last_tsn
                    );
                    self.reconfig_requests
                        .insert(p.request_sequence_number, p.clone());
                    ReconfigResult::InProgress
                } else {
                    log::debug!(
                        "[{}] resetStream(): senderLastTSN={} <= peerLastTSN={}",
                        self.name,
                        p.sender_last_tsn,
                        self.peer_last_tsn
                    );
                    for si in &p.stream_identifiers {
                        self.unregister_stream(*si);
                    }
                    ReconfigResult::SuccessPerformed
                }
            }
            ReconfigRequest::IncomingReset(p) => {
                // the peer wants our outgoing side of these streams reset;
                // restart the sequence number space
                for si in &p.stream_identifiers {
                    if let Some(s) = self.streams.get(si) {
                        s.sequence_number.store(0, Ordering::SeqCst);
                    }
                }
                ReconfigResult::SuccessPerformed
            }
            // a TSN reset would invalidate the reliability engine state
            ReconfigRequest::SsnTsnReset(_) => ReconfigResult::Denied,
            ReconfigRequest::AddStreams(p) => {
                let n = p.number_of_new_streams as u32;
                let cur = if p.incoming {
                    self.my_max_num_outbound_streams as u32
                } else {
                    self.my_max_num_inbound_streams as u32
                };
                if n == 0 || cur + n > u16::MAX as u32 {
                    ReconfigResult::Denied
                } else {
                    if p.incoming {
                        self.my_max_num_outbound_streams = (cur + n) as u16;
                    } else {
                        self.my_max_num_inbound_streams = (cur + n) as u16;
                    }
                    ReconfigResult::SuccessPerformed
                }
            }
        }
    }

    /// An In Progress outgoing-reset request becomes performable once the
    /// peer's cumulative TSN reaches the request's last assigned TSN.
    async fn retry_outgoing_reset_request(
        &mut self,
        p: &ParamOutgoingResetRequest,
        reply: &mut Vec<Packet>,
    ) -> Result<()> {
        if sna32gt(p.sender_last_tsn, self.peer_last_tsn) {
            return Ok(());
        }

        self.reconfig_requests.remove(&p.request_sequence_number);
        for si in &p.stream_identifiers {
            self.unregister_stream(*si);
        }

        let resp = ParamReconfigResponse {
            response_sequence_number: p.request_sequence_number,
            result: ReconfigResult::SuccessPerformed,
        };
        self.cached_reconfig_responses
            .insert(p.request_sequence_number, resp.clone());
        reply.push(self.create_reconfig_response_packet(resp));

        if p.request_sequence_number == self.expected_peer_rsn {
            self.expected_peer_rsn = self.expected_peer_rsn.wrapping_add(1);
            if let Some(next) = self.held_reconfig_requests.remove(&self.expected_peer_rsn) {
                self.sequence_reconfig_request(next, reply);
            }
        }

        Ok(())
    }

    fn create_reconfig_response_packet(&self, resp: ParamReconfigResponse) -> Packet {
        self.create_packet(vec![Box::new(ChunkReconfig {
            param_a: Some(Box::new(resp)),
            param_b: None,
        })])
    }

    async fn handle_reconfig_response(&mut self, p: &ParamReconfigResponse) -> Result<()> {
        log::trace!("[{}] handle_reconfig_response: {}", self.name, p);

        match p.result {
            // the reconfig timer keeps retransmitting the request
            ReconfigResult::InProgress => return Ok(()),
            ReconfigResult::SuccessPerformed | ReconfigResult::SuccessNop => {
                if let Some(c) = self.reconfigs.remove(&p.response_sequence_number) {
                    if let Some(param_a) = &c.param_a {
                        if let Some(req) =
                            param_a.as_any().downcast_ref::<ParamOutgoingResetRequest>()
                        {
                            let sis = req.stream_identifiers.clone();
                            for si in sis {
                                self.unregister_stream(si);
                            }
                        }
                    }
                }
            }
            _ => {
                log::warn!(
                    "[{}] reconfig request rsn={} failed: {}",
                    self.name,
                    p.response_sequence_number,
                    p.result
                );
                self.reconfigs.remove(&p.response_sequence_number);
            }
        }

        if self.reconfigs.is_empty() {
            if let Some(treconfig) = &self.treconfig {
                treconfig.stop().await;
            }
        }

        Ok(())
    }

    /// Bytes queued locally but not yet acknowledged by the peer.
    pub(crate) fn buffered_amount(&self) -> usize {
        self.pending_queue.get_num_bytes() + self.inflight_queue.get_num_bytes()
    }

    fn generate_next_tsn(&mut self) -> u32 {
        let tsn = self.my_next_tsn;
        self.my_next_tsn = self.my_next_tsn.wrapping_add(1);
        tsn
    }

    fn generate_next_rsn(&mut self) -> u32 {
        let rsn = self.my_next_rsn;
        self.my_next_rsn = self.my_next_rsn.wrapping_add(1);
        rsn
    }

    async fn create_selective_ack_chunk(&mut self) -> ChunkSack {
        ChunkSack {
            cumulative_tsn_ack: self.peer_last_tsn,
            advertised_receiver_window_credit: self.get_my_receiver_window_credit().await,
            gap_ack_blocks: self.payload_queue.get_gap_ack_blocks(self.peer_last_tsn),
            duplicate_tsn: self.payload_queue.pop_duplicates(),
        }
    }

    /// Builds a FORWARD TSN (RFC 3758 section 3.5 C4): for every stream
    /// with abandoned ordered chunks up to the advanced ack point, the
    /// largest SSN being skipped.
    fn create_forward_tsn(&self) -> ChunkForwardTsn {
        let mut stream_map: HashMap<u16, u16> = HashMap::new();
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lte(i, self.advanced_peer_tsn_ack_point) {
            if let Some(c) = self.inflight_queue.get(i) {
                if !c.unordered {
                    match stream_map.get(&c.stream_identifier) {
                        Some(ssn) if !sna16lt(*ssn, c.stream_sequence_number) => {}
                        _ => {
                            stream_map.insert(c.stream_identifier, c.stream_sequence_number);
                        }
                    }
                }
            } else {
                break;
            }
            i = i.wrapping_add(1);
        }

        let mut fwd = ChunkForwardTsn {
            new_cumulative_tsn: self.advanced_peer_tsn_ack_point,
            streams: Vec::with_capacity(stream_map.len()),
        };

        for (si, ssn) in &stream_map {
            fwd.streams.push(ChunkForwardTsnStream {
                identifier: *si,
                sequence: *ssn,
            });
        }

        fwd
    }

    fn create_packet(&self, chunks: Vec<Box<dyn Chunk + Send + Sync>>) -> Packet {
        Packet {
            verification_tag: self.peer_verification_tag,
            source_port: self.source_port,
            destination_port: self.destination_port,
            chunks,
        }
    }

    pub(crate) fn create_abort_packet(&self, reason: &str) -> Packet {
        self.create_packet(vec![Box::new(ChunkAbort {
            error_causes: vec![ErrorCause::user_initiated_abort(reason)],
        })])
    }

    /// Moves the front pending chunk into the inflight queue, assigning
    /// its TSN at this point so fragments of different messages never
    /// interleave.
    fn move_pending_data_chunk_to_inflight_queue(
        &mut self,
        beginning_fragment: bool,
        unordered: bool,
    ) -> Option<ChunkData> {
        if let Some(mut c) = self.pending_queue.pop(beginning_fragment, unordered) {
            c.set_all_inflight();

            // used for both the RTT measurement and the Timed policy
            c.since = Some(Instant::now());
            c.tsn = self.generate_next_tsn();
            c.nsent = 1; // being sent for the first time

            self.check_partial_reliability_status(&c);

            log::trace!(
                "[{}] sending tsn={} ssn={} sent={} len={} ({},{})",
                self.name,
                c.tsn,
                c.stream_sequence_number,
                c.nsent,
                c.user_data.len(),
                c.beginning_fragment,
                c.ending_fragment
            );

            self.inflight_queue.push_no_check(c.clone());

            Some(c)
        } else {
            log::error!("[{}] failed to pop from pending queue", self.name);
            None
        }
    }

    /// Pops chunks the congestion and receiver windows allow to be sent
    /// now. An empty-data chunk is the end-of-stream marker a closing
    /// stream queued; its identifier is collected for a reset request.
    fn pop_pending_data_chunks_to_send(&mut self) -> (Vec<ChunkData>, Vec<u16>) {
        let mut chunks = vec![];
        let mut sis_to_reset = vec![];

        if !self.pending_queue.is_empty() {
            // RFC 4960 section 6.1 A
            while let Some(c) = self.pending_queue.peek() {
                let (beginning_fragment, unordered, data_len, stream_identifier) = (
                    c.beginning_fragment,
                    c.unordered,
                    c.user_data.len(),
                    c.stream_identifier,
                );

                if data_len == 0 {
                    sis_to_reset.push(stream_identifier);
                    if self
                        .pending_queue
                        .pop(beginning_fragment, unordered)
                        .is_none()
                    {
                        log::error!("[{}] failed to pop from pending queue", self.name);
                    }
                    continue;
                }

                if self.inflight_queue.get_num_bytes() + data_len > self.cwnd as usize {
                    break; // would exceed cwnd
                }

                if data_len > self.rwnd as usize {
                    break; // no more rwnd
                }

                self.rwnd -= data_len as u32;

                if let Some(chunk) =
                    self.move_pending_data_chunk_to_inflight_queue(beginning_fragment, unordered)
                {
                    chunks.push(chunk);
                }
            }

            // RFC 4960 section 6.1 B: zero window probe
            if chunks.is_empty() && self.inflight_queue.is_empty() {
                if let Some(c) = self.pending_queue.peek() {
                    let (beginning_fragment, unordered, data_len, stream_identifier) = (
                        c.beginning_fragment,
                        c.unordered,
                        c.user_data.len(),
                        c.stream_identifier,
                    );

                    if data_len == 0 {
                        sis_to_reset.push(stream_identifier);
                        if self
                            .pending_queue
                            .pop(beginning_fragment, unordered)
                            .is_none()
                        {
                            log::error!("[{}] failed to pop from pending queue", self.name);
                        }
                    } else if let Some(chunk) = self
                        .move_pending_data_chunk_to_inflight_queue(beginning_fragment, unordered)
                    {
                        chunks.push(chunk);
                    }
                }
            }
        }

        (chunks, sis_to_reset)
    }

    fn bundle_data_chunks_into_packets(&self, chunks: Vec<ChunkData>) -> Vec<Packet> {
        let mut packets = vec![];
        let mut chunks_to_send: Vec<Box<dyn Chunk + Send + Sync>> = vec![];
        let mut bytes_in_packet = COMMON_HEADER_SIZE as usize;

        for c in chunks {
            // RFC 4960 section 6.10: bundle as many chunks as fit the MTU
            let chunk_size_in_packet = DATA_CHUNK_HEADER_SIZE as usize + c.user_data.len();
            if bytes_in_packet + chunk_size_in_packet > self.mtu as usize
                && !chunks_to_send.is_empty()
            {
                packets.push(self.create_packet(chunks_to_send));
                chunks_to_send = vec![];
                bytes_in_packet = COMMON_HEADER_SIZE as usize;
            }
            bytes_in_packet += chunk_size_in_packet;
            chunks_to_send.push(Box::new(c));
        }

        if !chunks_to_send.is_empty() {
            packets.push(self.create_packet(chunks_to_send));
        }

        packets
    }

    /// RFC 3758: abandon a chunk that has outlived its stream's partial
    /// reliability policy. DCEP control messages are always reliable
    /// (RFC 8832 section 4).
    fn check_partial_reliability_status(&self, c: &ChunkData) {
        if !self.use_forward_tsn {
            return;
        }
        if c.payload_type == PayloadProtocolIdentifier::Dcep {
            return;
        }

        if let Some(s) = self.streams.get(&c.stream_identifier) {
            let reliability_type: ReliabilityType =
                s.reliability_type.load(Ordering::SeqCst).into();
            let reliability_value = s.reliability_value.load(Ordering::SeqCst);

            match reliability_type {
                ReliabilityType::Rexmit => {
                    if c.nsent > reliability_value {
                        c.set_abandoned(true);
                        log::trace!(
                            "[{}] marked as abandoned: tsn={} ppi={} (remix: {})",
                            self.name,
                            c.tsn,
                            c.payload_type,
                            c.nsent
                        );
                    }
                }
                ReliabilityType::Timed => {
                    if let Some(since) = &c.since {
                        let elapsed = since.elapsed().as_millis() as u64;
                        if elapsed >= reliability_value as u64 {
                            c.set_abandoned(true);
                            log::trace!(
                                "[{}] marked as abandoned: tsn={} ppi={} (timed: {})",
                                self.name,
                                c.tsn,
                                c.payload_type,
                                elapsed
                            );
                        }
                    }
                }
                ReliabilityType::Reliable => {}
            }
        }
    }

    /// Chunks flagged for retransmission, capped at min(cwnd, rwnd)
    /// bytes, except the first chunk, which goes out regardless as a zero
    /// window probe.
    fn get_data_packets_to_retransmit(&mut self) -> Vec<Packet> {
        let awnd = std::cmp::min(self.cwnd, self.rwnd);
        let mut chunks = vec![];
        let mut bytes_to_send = 0;
        let mut done = false;
        let mut i = 0;

        while !done {
            let tsn = self.cumulative_tsn_ack_point.wrapping_add(i + 1);
            i += 1;

            let c2 = {
                let c = match self.inflight_queue.get_mut(tsn) {
                    Some(c) => c,
                    None => break,
                };
                if !c.retransmit {
                    continue;
                }

                if i == 1 && self.rwnd < c.user_data.len() as u32 {
                    // Send it as a zero window probe
                    done = true;
                } else if bytes_to_send + c.user_data.len() > awnd as usize {
                    break;
                }

                c.retransmit = false;
                bytes_to_send += c.user_data.len();
                c.nsent += 1;
                c.clone()
            };

            self.check_partial_reliability_status(&c2);

            log::trace!(
                "[{}] retransmitting tsn={} ssn={} sent={}",
                self.name,
                c2.tsn,
                c2.stream_sequence_number,
                c2.nsent
            );

            chunks.push(c2);
        }

        self.bundle_data_chunks_into_packets(chunks)
    }

    fn gather_data_packets_to_retransmit(&mut self, mut raw_packets: Vec<Packet>) -> Vec<Packet> {
        for p in self.get_data_packets_to_retransmit() {
            raw_packets.push(p);
        }
        raw_packets
    }

    async fn gather_outbound_data_and_reconfig_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> Vec<Packet> {
        // Pop unsent data chunks from the pending queue to send as much
        // as cwnd and rwnd allow
        let (chunks, sis_to_reset) = self.pop_pending_data_chunks_to_send();
        if !chunks.is_empty() {
            // Start the retransmission timer (noop if already running)
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.start(self.rto_mgr.get_rto()).await;
            }
            for p in self.bundle_data_chunks_into_packets(chunks) {
                raw_packets.push(p);
            }
        }

        if !sis_to_reset.is_empty() || self.will_retransmit_reconfig {
            if self.will_retransmit_reconfig {
                self.will_retransmit_reconfig = false;
                log::debug!(
                    "[{}] retransmit {} RECONFIG chunk(s)",
                    self.name,
                    self.reconfigs.len()
                );
                for c in self.reconfigs.values() {
                    let p = self.create_packet(vec![Box::new(c.clone())]);
                    raw_packets.push(p);
                }
            }

            if !sis_to_reset.is_empty() {
                let rsn = self.generate_next_rsn();
                let tsn = self.my_next_tsn.wrapping_sub(1);
                log::debug!(
                    "[{}] sending RECONFIG: rsn={} tsn={} streams={:?}",
                    self.name,
                    rsn,
                    tsn,
                    sis_to_reset
                );

                let c = ChunkReconfig {
                    param_a: Some(Box::new(ParamOutgoingResetRequest {
                        request_sequence_number: rsn,
                        sender_last_tsn: tsn,
                        stream_identifiers: sis_to_reset,
                        ..Default::default()
                    })),
                    param_b: None,
                };
                // store the chunk for the response
                self.reconfigs.insert(rsn, c.clone());

                let p = self.create_packet(vec![Box::new(c)]);
                raw_packets.push(p);
            }

            if !self.reconfigs.is_empty() {
                if let Some(treconfig) = &self.treconfig {
                    treconfig.start(self.rto_mgr.get_rto()).await;
                }
            }
        }

        raw_packets
    }

    fn gather_outbound_fast_retransmission_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> Vec<Packet> {
        if self.will_retransmit_fast {
            self.will_retransmit_fast = false;

            let mut to_fast_retrans: Vec<Box<dyn Chunk + Send + Sync>> = vec![];
            let mut fast_retrans_size = COMMON_HEADER_SIZE;

            let mut i = 0;
            loop {
                let tsn = self.cumulative_tsn_ack_point.wrapping_add(i + 1);
                i += 1;

                let c2 = {
                    let c = match self.inflight_queue.get_mut(tsn) {
                        Some(c) => c,
                        None => break,
                    };

                    // RFC 4960 section 7.2.4 3): only chunks with exactly
                    // three miss indications, not yet retransmitted
                    if c.acked || c.abandoned() || c.nsent > 1 || c.miss_indicator < 3 {
                        continue;
                    }

                    // RFC 4960 section 7.2.4 2): restrict to one packet
                    let data_chunk_size = DATA_CHUNK_HEADER_SIZE + c.user_data.len() as u32;
                    if self.mtu < fast_retrans_size + data_chunk_size {
                        break;
                    }

                    fast_retrans_size += data_chunk_size;
                    c.nsent += 1;
                    c.clone()
                };

                self.check_partial_reliability_status(&c2);
                self.stats.inc_fast_retrans();

                log::trace!("[{}] fast retransmitting tsn={}", self.name, c2.tsn);
                to_fast_retrans.push(Box::new(c2));
            }

            if !to_fast_retrans.is_empty() {
                let p = self.create_packet(to_fast_retrans);
                raw_packets.push(p);
            }
        }

        raw_packets
    }

    async fn gather_outbound_sack_packets(&mut self, mut raw_packets: Vec<Packet>) -> Vec<Packet> {
        if self.ack_state == AckState::Immediate {
            self.ack_state = AckState::Idle;
            let sack = self.create_selective_ack_chunk().await;
            log::debug!("[{}] sending SACK: {}", self.name, sack);
            let p = self.create_packet(vec![Box::new(sack)]);
            raw_packets.push(p);
        }
        raw_packets
    }

    fn gather_outbound_forward_tsn_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> Vec<Packet> {
        if self.will_send_forward_tsn {
            self.will_send_forward_tsn = false;
            if sna32gt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            ) {
                let fwd_tsn = self.create_forward_tsn();
                let p = self.create_packet(vec![Box::new(fwd_tsn)]);
                raw_packets.push(p);
            }
        }
        raw_packets
    }

    async fn gather_outbound_shutdown_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> (Vec<Packet>, bool) {
        let mut ok = true;

        if self.will_send_shutdown.load(Ordering::SeqCst) {
            self.will_send_shutdown.store(false, Ordering::SeqCst);

            let shutdown = ChunkShutdown {
                cumulative_tsn_ack: self.peer_last_tsn,
            };
            raw_packets.push(self.create_packet(vec![Box::new(shutdown)]));

            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.start(self.rto_mgr.get_rto()).await;
            }
        } else if self.will_send_shutdown_ack {
            self.will_send_shutdown_ack = false;

            raw_packets.push(self.create_packet(vec![Box::new(ChunkShutdownAck)]));

            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.start(self.rto_mgr.get_rto()).await;
            }
        } else if self.will_send_shutdown_complete {
            self.will_send_shutdown_complete = false;

            raw_packets.push(self.create_packet(vec![Box::new(ChunkShutdownComplete)]));
            // the write loop ends after flushing SHUTDOWN COMPLETE
            ok = false;
        }

        (raw_packets, ok)
    }

    /// Collects everything ready to go onto the wire. The bool result
    /// turns false once the write loop should stop after sending these.
    pub(crate) async fn gather_outbound(&mut self) -> (Vec<Packet>, bool) {
        let mut raw_packets = Vec::with_capacity(16);

        if !self.control_queue.is_empty() {
            for p in self.control_queue.drain(..) {
                raw_packets.push(p);
            }
        }

        let state = self.get_state();
        match state {
            AssociationState::Established => {
                raw_packets = self.gather_data_packets_to_retransmit(raw_packets);
                raw_packets = self
                    .gather_outbound_data_and_reconfig_packets(raw_packets)
                    .await;
                raw_packets = self.gather_outbound_fast_retransmission_packets(raw_packets);
                raw_packets = self.gather_outbound_sack_packets(raw_packets).await;
                raw_packets = self.gather_outbound_forward_tsn_packets(raw_packets);
                (raw_packets, true)
            }
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {
                raw_packets = self.gather_data_packets_to_retransmit(raw_packets);
                raw_packets = self.gather_outbound_fast_retransmission_packets(raw_packets);
                raw_packets = self.gather_outbound_sack_packets(raw_packets).await;
                self.gather_outbound_shutdown_packets(raw_packets).await
            }
            AssociationState::ShutdownAckSent => {
                self.gather_outbound_shutdown_packets(raw_packets).await
            }
            _ => (raw_packets, true),
        }
    }
}

#[async_trait]
impl AckTimerObserver for AssociationInternal {
    async fn on_ack_timeout(&mut self) {
        log::trace!(
            "[{}] ack timed out (ack_state: {})",
            self.name,
            self.ack_state
        );
        self.stats.inc_ack_timeouts();
        self.ack_state = AckState::Immediate;
        self.awake_write_loop();
    }
}

#[async_trait]
impl RtxTimerObserver for AssociationInternal {
    async fn on_retransmission_timeout(&mut self, id: RtxTimerId, n_rtos: usize) {
        match id {
            RtxTimerId::T1Init => {
                if let Err(err) = self.send_init() {
                    log::debug!(
                        "[{}] failed to retransmit init (n_rtos={}): {:?}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }

            RtxTimerId::T1Cookie => {
                if let Err(err) = self.send_cookie_echo() {
                    log::debug!(
                        "[{}] failed to retransmit cookie-echo (n_rtos={}): {:?}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }

            RtxTimerId::T2Shutdown => {
                log::debug!(
                    "[{}] retransmission of shutdown timeout (n_rtos={})",
                    self.name,
                    n_rtos
                );
                let state = self.get_state();
                match state {
                    AssociationState::ShutdownSent => {
                        self.will_send_shutdown.store(true, Ordering::SeqCst);
                        self.awake_write_loop();
                    }
                    AssociationState::ShutdownAckSent => {
                        self.will_send_shutdown_ack = true;
                        self.awake_write_loop();
                    }
                    _ => {}
                }
            }

            RtxTimerId::T3Rtx => {
                self.stats.inc_t3timeouts();

                // RFC 4960 section 6.3.3 E1, E2
                self.ssthresh = std::cmp::max(self.cwnd / 2, 4 * self.mtu);
                self.cwnd = self.mtu;
                self.partial_bytes_acked = 0;
                self.in_fast_recovery = false;

                // RFC 3758 section 3.5 A2: with no SACK in sight, advance
                // the ack point over abandoned chunks here
                if self.use_forward_tsn {
                    let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
                    while let Some(c) = self.inflight_queue.get(i) {
                        if !c.abandoned() {
                            break;
                        }
                        self.advanced_peer_tsn_ack_point = i;
                        i = i.wrapping_add(1);
                    }

                    if sna32gt(
                        self.advanced_peer_tsn_ack_point,
                        self.cumulative_tsn_ack_point,
                    ) {
                        self.will_send_forward_tsn = true;
                    }
                }

                log::trace!(
                    "[{}] T3-rtx timed out: n_rtos={} cwnd={} ssthresh={}",
                    self.name,
                    n_rtos,
                    self.cwnd,
                    self.ssthresh
                );

                self.inflight_queue.mark_all_to_retransmit();
                self.awake_write_loop();
            }

            RtxTimerId::Reconfig => {
                self.will_retransmit_reconfig = true;
                self.awake_write_loop();
            }
        }
    }

    async fn on_retransmission_failure(&mut self, id: RtxTimerId) {
        match id {
            RtxTimerId::T1Init => {
                log::error!("[{}] retransmission failure: T1-init", self.name);
                self.complete_handshake(Some(Error::ErrHandshakeInitAck))
                    .await;
            }
            RtxTimerId::T1Cookie => {
                log::error!("[{}] retransmission failure: T1-cookie", self.name);
                self.complete_handshake(Some(Error::ErrHandshakeCookieEcho))
                    .await;
            }
            RtxTimerId::T2Shutdown => {
                log::error!("[{}] retransmission failure: T2-shutdown", self.name);
            }
            RtxTimerId::T3Rtx => {
                // the retransmission limit was reached, the peer is gone
                log::error!("[{}] retransmission failure: T3-rtx", self.name);
                if let Err(err) = self
                    .close_with_reason("peer unreachable: too many retransmissions".to_owned())
                    .await
                {
                    log::warn!("[{}] failed to close association: {:?}", self.name, err);
                }
            }
            RtxTimerId::Reconfig => {
                log::error!("[{}] retransmission failure: reconfig", self.name);
            }
        }
    }
}

#[cfg(test)]
mod association_internal_test {
    use super::*;

    use crate::chunk::chunk_header::ChunkHeader;
    use crate::chunk::chunk_type::ChunkType;
    use util::conn::conn_pipe::pipe;

    fn make_engine(name: &str) -> AssociationInternal {
        let (conn, _remote) = pipe();
        let (close_loop_ch_tx, _close_loop_ch_rx) = broadcast::channel(1);
        let (handshake_completed_ch_tx, _handshake_completed_ch_rx) = mpsc::channel(1);
        let (awake_write_loop_ch_tx, _awake_write_loop_ch_rx) = mpsc::channel(1);

        AssociationInternal::new(
            Config {
                net_conn: Arc::new(conn),
                max_receive_buffer_size: 0,
                max_message_size: 0,
                ack_interval: Duration::ZERO,
                max_retransmits: 0,
                cookie_lifetime: Duration::ZERO,
                listener: None,
                name: name.to_owned(),
            },
            close_loop_ch_tx,
            handshake_completed_ch_tx,
            Arc::new(awake_write_loop_ch_tx),
            Arc::new(Mutex::new(None)),
        )
    }

    fn reconfig_response(p: &Packet) -> ParamReconfigResponse {
        let c = p.chunks[0]
            .as_any()
            .downcast_ref::<ChunkReconfig>()
            .expect("expected a RECONFIG chunk");
        let param_a = c.param_a.as_ref().expect("expected param A");
        param_a
            .as_any()
            .downcast_ref::<ParamReconfigResponse>()
            .expect("expected a reconfig response")
            .clone()
    }

    fn incoming_reset(rsn: u32) -> ReconfigRequest {
        ReconfigRequest::IncomingReset(ParamIncomingResetRequest {
            request_sequence_number: rsn,
            stream_identifiers: vec![],
        })
    }

    #[test]
    fn test_reconfig_requests_apply_in_rsn_order() {
        let mut a = make_engine("reconfig-order");
        a.expected_peer_rsn = 10;

        // a request from the future is held, not answered
        let mut reply = vec![];
        a.sequence_reconfig_request(incoming_reset(12), &mut reply);
        assert!(reply.is_empty());
        assert!(a.held_reconfig_requests.contains_key(&12));
        assert_eq!(a.expected_peer_rsn, 10);

        // the expected request applies, then drains toward the held one
        let mut reply = vec![];
        a.sequence_reconfig_request(incoming_reset(10), &mut reply);
        assert_eq!(reply.len(), 1);
        assert_eq!(
            reconfig_response(&reply[0]).result,
            ReconfigResult::SuccessPerformed
        );
        assert_eq!(a.expected_peer_rsn, 11, "11 is still missing");
        assert!(a.held_reconfig_requests.contains_key(&12));

        // the gap fills: 11 applies and 12 drains right behind it
        let mut reply = vec![];
        a.sequence_reconfig_request(incoming_reset(11), &mut reply);
        assert_eq!(reply.len(), 2);
        assert_eq!(reconfig_response(&reply[0]).response_sequence_number, 11);
        assert_eq!(reconfig_response(&reply[1]).response_sequence_number, 12);
        assert_eq!(a.expected_peer_rsn, 13);
        assert!(a.held_reconfig_requests.is_empty());
    }

    #[test]
    fn test_duplicate_reconfig_request_gets_cached_response_verbatim() {
        let mut a = make_engine("reconfig-dup");
        a.expected_peer_rsn = 7;

        let mut reply = vec![];
        a.sequence_reconfig_request(incoming_reset(7), &mut reply);
        assert_eq!(reply.len(), 1);
        let first = reconfig_response(&reply[0]);

        // a retransmitted request must not execute again; it only gets
        // the original response back
        let mut reply = vec![];
        a.sequence_reconfig_request(incoming_reset(7), &mut reply);
        assert_eq!(reply.len(), 1);
        let second = reconfig_response(&reply[0]);
        assert_eq!(second.response_sequence_number, first.response_sequence_number);
        assert_eq!(second.result, first.result);
        assert_eq!(a.expected_peer_rsn, 8, "expected rsn must not re-advance");
    }

    #[test]
    fn test_old_rsn_without_cached_response_is_rejected() {
        let mut a = make_engine("reconfig-bad-rsn");
        a.expected_peer_rsn = 20;

        let mut reply = vec![];
        a.sequence_reconfig_request(incoming_reset(15), &mut reply);
        assert_eq!(reply.len(), 1);
        let resp = reconfig_response(&reply[0]);
        assert_eq!(resp.response_sequence_number, 15);
        assert_eq!(resp.result, ReconfigResult::ErrorBadSequenceNumber);
    }

    #[tokio::test]
    async fn test_outgoing_reset_defers_until_peer_tsn_catches_up() -> Result<()> {
        let mut a = make_engine("reconfig-in-progress");
        a.peer_last_tsn = 100;
        a.expected_peer_rsn = 30;
        a.create_stream(7, false);

        // the peer still has TSNs 101..=105 outstanding on this stream
        let req = ReconfigRequest::OutgoingReset(ParamOutgoingResetRequest {
            request_sequence_number: 30,
            sender_last_tsn: 105,
            stream_identifiers: vec![7],
            ..Default::default()
        });
        let mut reply = vec![];
        a.sequence_reconfig_request(req, &mut reply);
        assert_eq!(reply.len(), 1);
        assert_eq!(
            reconfig_response(&reply[0]).result,
            ReconfigResult::InProgress
        );
        assert!(a.streams.contains_key(&7), "stream must stay until drained");
        assert_eq!(a.expected_peer_rsn, 30, "held at the in-progress request");

        // the outstanding TSNs arrive; the reset now performs
        a.peer_last_tsn = 105;
        let reply = a.handle_peer_last_tsn_and_acknowledgement(false).await?;
        assert_eq!(reply.len(), 1);
        let resp = reconfig_response(&reply[0]);
        assert_eq!(resp.response_sequence_number, 30);
        assert_eq!(resp.result, ReconfigResult::SuccessPerformed);
        assert!(!a.streams.contains_key(&7));
        assert!(a.reconfig_requests.is_empty());
        assert_eq!(a.expected_peer_rsn, 31);
        Ok(())
    }

    #[test]
    fn test_ssn_tsn_reset_is_denied_and_add_streams_grows() {
        let mut a = make_engine("reconfig-misc");
        a.expected_peer_rsn = 1;
        a.my_max_num_outbound_streams = 100;

        let mut reply = vec![];
        a.sequence_reconfig_request(
            ReconfigRequest::SsnTsnReset(ParamSsnTsnResetRequest {
                request_sequence_number: 1,
            }),
            &mut reply,
        );
        assert_eq!(reconfig_response(&reply[0]).result, ReconfigResult::Denied);

        let mut reply = vec![];
        a.sequence_reconfig_request(
            ReconfigRequest::AddStreams(ParamAddStreams {
                incoming: true,
                request_sequence_number: 2,
                number_of_new_streams: 16,
            }),
            &mut reply,
        );
        assert_eq!(
            reconfig_response(&reply[0]).result,
            ReconfigResult::SuccessPerformed
        );
        assert_eq!(a.my_max_num_outbound_streams, 116);
    }

    fn unknown_chunk(typ: u8) -> ChunkUnknown {
        ChunkUnknown {
            header: ChunkHeader {
                typ: ChunkType(typ),
                flags: 0,
                value_length: 0,
            },
            value: Bytes::new(),
        }
    }

    #[test]
    fn test_unknown_chunk_high_bits_drive_handling() {
        let mut a = make_engine("unknown-chunks");

        // 00: drop the rest of the packet, no report
        let r = a.handle_unknown_chunk(&unknown_chunk(0x3f));
        assert!(matches!(r, Err(Error::ErrSilentlyDiscard)));
        assert!(a.control_queue.is_empty());

        // 01: drop the rest of the packet, report in an ERROR
        let r = a.handle_unknown_chunk(&unknown_chunk(0x7f));
        assert!(matches!(r, Err(Error::ErrSilentlyDiscard)));
        assert_eq!(a.control_queue.len(), 1);
        a.control_queue.clear();

        // 10: skip this chunk, keep going, no report
        let r = a.handle_unknown_chunk(&unknown_chunk(0xbf));
        assert!(matches!(r, Ok(ref v) if v.is_empty()));

        // 11: skip this chunk, keep going, report in an ERROR
        let r = a.handle_unknown_chunk(&unknown_chunk(0xff));
        match r {
            Ok(reply) => {
                assert_eq!(reply.len(), 1);
                let c = reply[0].chunks[0]
                    .as_any()
                    .downcast_ref::<ChunkError>()
                    .expect("expected an ERROR chunk");
                assert_eq!(c.error_causes[0].code, UNRECOGNIZED_CHUNK_TYPE);
            }
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_sack_is_ignored() -> Result<()> {
        let mut a = make_engine("stale-sack");
        a.set_state(AssociationState::Established);
        a.cumulative_tsn_ack_point = 1000;

        let reply = a
            .handle_sack(&ChunkSack {
                cumulative_tsn_ack: 995,
                advertised_receiver_window_credit: 64 * 1024,
                gap_ack_blocks: vec![],
                duplicate_tsn: vec![],
            })
            .await?;
        assert!(reply.is_empty());
        assert_eq!(a.cumulative_tsn_ack_point, 1000, "ack point must not move back");
        Ok(())
    }

    #[tokio::test]
    async fn test_init_primes_reconfig_and_forward_tsn_state() -> Result<()> {
        let mut a = make_engine("handle-init");

        let mut init = ChunkInit {
            initiate_tag: 1234,
            advertised_receiver_window_credit: 64 * 1024,
            num_outbound_streams: 10,
            num_inbound_streams: 10,
            initial_tsn: 5678,
            ..Default::default()
        };
        init.set_supported_extensions();

        let p = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 0,
            chunks: vec![],
        };
        let reply = a.handle_init(&p, &init)?;
        assert_eq!(reply.len(), 1, "expected an INIT ACK");

        assert_eq!(a.peer_last_tsn, 5677);
        assert_eq!(a.expected_peer_rsn, 5678);
        assert!(a.use_forward_tsn);

        let ack = reply[0].chunks[0]
            .as_any()
            .downcast_ref::<ChunkInit>()
            .expect("expected an INIT ACK chunk");
        assert!(ack.is_ack);
        let has_cookie = ack
            .params
            .iter()
            .any(|param| param.as_any().downcast_ref::<ParamStateCookie>().is_some());
        assert!(has_cookie, "INIT ACK must carry a state cookie");
        Ok(())
    }
}
