use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

use crate::association::RtxTimerId;

/// RTO.Initial in msec (RFC 4960 section 15).
pub(crate) const RTO_INITIAL: u64 = 3000;
/// RTO.Min in msec.
pub(crate) const RTO_MIN: u64 = 1000;
/// RTO.Max in msec.
pub(crate) const RTO_MAX: u64 = 60000;
/// RTO.Alpha: 1/8.
pub(crate) const RTO_ALPHA: f64 = 0.125;
/// RTO.Beta: 1/4.
pub(crate) const RTO_BETA: f64 = 0.25;

/// Max.Init.Retransmits (RFC 4960 section 15).
pub(crate) const MAX_INIT_RETRANS: usize = 8;
/// Path.Max.Retrans.
pub(crate) const PATH_MAX_RETRANS: usize = 5;
/// Retransmit without limit.
pub(crate) const NO_MAX_RETRANS: usize = 0;

/// Smoothed RTO calculator following RFC 4960 section 6.3.1.
#[derive(Default, Debug)]
pub(crate) struct RtoManager {
    pub(crate) srtt: u64,
    pub(crate) rttvar: f64,
    pub(crate) rto: u64,
    pub(crate) no_update: bool,
}

impl RtoManager {
    pub(crate) fn new() -> Self {
        RtoManager {
            rto: RTO_INITIAL,
            ..Default::default()
        }
    }

    /// Folds a new RTT measurement (msec) into the smoothed estimate and
    /// recomputes the RTO. Returns the new SRTT.
    pub(crate) fn set_new_rtt(&mut self, rtt: u64) -> u64 {
        if self.no_update {
            return self.srtt;
        }

        if self.srtt == 0 {
            // first measurement
            self.srtt = rtt;
            self.rttvar = rtt as f64 / 2.0;
        } else {
            self.rttvar =
                (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt as f64 - rtt as f64).abs();
            self.srtt = ((1.0 - RTO_ALPHA) * self.srtt as f64 + RTO_ALPHA * rtt as f64) as u64;
        }

        self.rto = ((self.srtt as f64 + 4.0 * self.rttvar) as u64).clamp(RTO_MIN, RTO_MAX);

        self.srtt
    }

    pub(crate) fn get_rto(&self) -> u64 {
        self.rto
    }

    /// Back to the initial state, for when the peer stops answering.
    pub(crate) fn reset(&mut self) {
        if self.no_update {
            return;
        }
        self.srtt = 0;
        self.rttvar = 0.0;
        self.rto = RTO_INITIAL;
    }
}

/// Exponential backoff for consecutive expirations of one timer
/// (RFC 4960 section 6.3.3 rule E2), capped at RTO.Max.
pub(crate) fn calculate_next_timeout(rto: u64, n_rtos: usize) -> u64 {
    if n_rtos < 31 {
        let m = 1u64 << n_rtos;
        std::cmp::min(rto.saturating_mul(m), RTO_MAX)
    } else {
        RTO_MAX
    }
}

#[async_trait]
pub(crate) trait RtxTimerObserver {
    async fn on_retransmission_timeout(&mut self, timer_id: RtxTimerId, n_rtos: usize);
    async fn on_retransmission_failure(&mut self, timer_id: RtxTimerId);
}

/// Retransmission timer with backoff. Each expiration notifies the
/// observer; crossing `max_retrans` reports failure and stops the timer.
/// With `max_retrans` of 0 the timer retries forever.
#[derive(Debug)]
pub(crate) struct RtxTimer<T: 'static + RtxTimerObserver + Send> {
    pub(crate) timeout_observer: Weak<Mutex<T>>,
    pub(crate) id: RtxTimerId,
    pub(crate) max_retrans: usize,
    close_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl<T: 'static + RtxTimerObserver + Send> RtxTimer<T> {
    pub(crate) fn new(timeout_observer: Weak<Mutex<T>>, id: RtxTimerId, max_retrans: usize) -> Self {
        RtxTimer {
            timeout_observer,
            id,
            max_retrans,
            close_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Arms the timer with the given RTO in msec. A second start while
    /// running is ignored and returns false; the first start wins.
    pub(crate) async fn start(&self, rto: u64) -> bool {
        let mut close_tx = self.close_tx.lock().await;
        if close_tx.is_some() {
            return false;
        }

        let (tx, mut close_rx) = mpsc::channel(1);
        let id = self.id;
        let max_retrans = self.max_retrans;
        let timeout_observer = self.timeout_observer.clone();
        let shared_close_tx = Arc::clone(&self.close_tx);

        tokio::spawn(async move {
            let mut n_rtos = 0usize;

            loop {
                let interval = calculate_next_timeout(rto, n_rtos);
                let timer = sleep(Duration::from_millis(interval));
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => {
                        n_rtos += 1;

                        let observer = match timeout_observer.upgrade() {
                            Some(observer) => observer,
                            None => break,
                        };
                        if max_retrans == 0 || n_rtos <= max_retrans {
                            let mut observer = observer.lock().await;
                            observer.on_retransmission_timeout(id, n_rtos).await;
                        } else {
                            {
                                let mut close_tx = shared_close_tx.lock().await;
                                close_tx.take();
                            }
                            let mut observer = observer.lock().await;
                            observer.on_retransmission_failure(id).await;
                            break;
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });

        *close_tx = Some(tx);
        true
    }

    /// Disarms the timer. A no-op when it is not running.
    pub(crate) async fn stop(&self) {
        let mut close_tx = self.close_tx.lock().await;
        close_tx.take();
    }

    pub(crate) async fn is_running(&self) -> bool {
        let close_tx = self.close_tx.lock().await;
        close_tx.is_some()
    }
}
