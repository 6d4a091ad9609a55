use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};

use super::ack_timer::*;
use super::rtx_timer::*;
use crate::association::RtxTimerId;

///////////////////////////////////////////////////////////////////
// ack_timer
///////////////////////////////////////////////////////////////////

struct CountingAckObserver {
    fired: Arc<AtomicU32>,
}

#[async_trait]
impl AckTimerObserver for CountingAckObserver {
    async fn on_ack_timeout(&mut self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

// The timer only holds a Weak; the caller keeps the returned Arc alive.
#[allow(clippy::type_complexity)]
fn counting_ack_timer(
    interval: Duration,
) -> (
    AckTimer<CountingAckObserver>,
    Arc<AtomicU32>,
    Arc<Mutex<CountingAckObserver>>,
) {
    let fired = Arc::new(AtomicU32::new(0));
    let obs = Arc::new(Mutex::new(CountingAckObserver {
        fired: fired.clone(),
    }));
    let timer = AckTimer::new(Arc::downgrade(&obs), interval);
    (timer, fired, obs)
}

#[tokio::test]
async fn test_ack_timer_fires_once_per_arm() {
    let (mut timer, fired, _obs) = counting_ack_timer(Duration::from_millis(20));

    assert!(timer.start(), "first arm must be accepted");
    assert!(!timer.start(), "re-arm while pending must be rejected");
    assert!(timer.is_running());

    sleep(Duration::from_millis(80)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1, "one expiration per arm");
}

#[tokio::test]
async fn test_ack_timer_cancel_and_rearm() {
    let (mut timer, fired, _obs) = counting_ack_timer(Duration::from_millis(20));

    assert!(timer.start());
    timer.stop();
    assert!(!timer.is_running());

    sleep(Duration::from_millis(60)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0, "cancelled arm never fires");

    assert!(timer.start(), "usable again after a stop");
    sleep(Duration::from_millis(60)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ack_timer_quiet_after_observer_drop() {
    let fired = Arc::new(AtomicU32::new(0));
    let obs = Arc::new(Mutex::new(CountingAckObserver {
        fired: fired.clone(),
    }));
    let mut timer = AckTimer::new(Arc::downgrade(&obs), Duration::from_millis(10));

    assert!(timer.start());
    drop(obs);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        fired.load(Ordering::SeqCst),
        0,
        "expiration against a dropped observer must be silent"
    );
}

///////////////////////////////////////////////////////////////////
// rto_manager
///////////////////////////////////////////////////////////////////

#[test]
fn test_rto_starts_at_initial() {
    let m = RtoManager::new();
    assert_eq!(m.get_rto(), RTO_INITIAL);
    assert_eq!(m.srtt, 0);
    assert_eq!(m.rttvar, 0.0);
}

#[test]
fn test_rto_tracks_smoothed_rtt() {
    let mut m = RtoManager::new();

    // the first sample seeds SRTT and sets RTTVAR to half the RTT
    assert_eq!(m.set_new_rtt(400), 400);
    assert_eq!(m.get_rto(), 1200); // srtt + 4 * rttvar

    // with a steady RTT the variance decays until RTO.Min takes over
    m.set_new_rtt(400);
    assert_eq!(m.get_rto(), 1000);
    m.set_new_rtt(400);
    assert_eq!(m.get_rto(), RTO_MIN, "clamped from below");
}

#[test]
fn test_rto_clamped_at_max() {
    let mut m = RtoManager::new();
    m.set_new_rtt(45_000);
    assert_eq!(m.get_rto(), RTO_MAX);
}

#[test]
fn test_rto_freeze_and_reset() {
    let mut m = RtoManager::new();
    m.set_new_rtt(400);

    m.no_update = true;
    assert_eq!(m.set_new_rtt(30_000), 400, "frozen estimate ignores samples");
    assert_eq!(m.get_rto(), 1200);

    m.no_update = false;
    m.reset();
    assert_eq!(m.get_rto(), RTO_INITIAL);
    assert_eq!(m.srtt, 0);
    assert_eq!(m.rttvar, 0.0);
}

#[test]
fn test_backoff_doubles_and_caps() {
    assert_eq!(calculate_next_timeout(500, 0), 500);
    assert_eq!(calculate_next_timeout(500, 1), 1000);
    assert_eq!(calculate_next_timeout(500, 6), 32000);
    assert_eq!(calculate_next_timeout(500, 7), RTO_MAX);
    assert_eq!(calculate_next_timeout(500, 63), RTO_MAX, "no shift overflow");
    assert_eq!(calculate_next_timeout(RTO_MAX, 2), RTO_MAX);
}

///////////////////////////////////////////////////////////////////
// rtx_timer
///////////////////////////////////////////////////////////////////

struct RtxRecorder {
    expected_id: RtxTimerId,
    timeout_tx: mpsc::UnboundedSender<usize>,
    failure_tx: mpsc::UnboundedSender<RtxTimerId>,
}

#[async_trait]
impl RtxTimerObserver for RtxRecorder {
    async fn on_retransmission_timeout(&mut self, timer_id: RtxTimerId, n_rtos: usize) {
        assert_eq!(timer_id, self.expected_id, "timeout for the wrong timer");
        let _ = self.timeout_tx.send(n_rtos);
    }

    async fn on_retransmission_failure(&mut self, timer_id: RtxTimerId) {
        let _ = self.failure_tx.send(timer_id);
    }
}

#[allow(clippy::type_complexity)]
fn recorder(
    expected_id: RtxTimerId,
) -> (
    Arc<Mutex<RtxRecorder>>,
    mpsc::UnboundedReceiver<usize>,
    mpsc::UnboundedReceiver<RtxTimerId>,
) {
    let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    (
        Arc::new(Mutex::new(RtxRecorder {
            expected_id,
            timeout_tx,
            failure_tx,
        })),
        timeout_rx,
        failure_rx,
    )
}

#[tokio::test]
async fn test_rtx_backoff_doubles_between_expirations() {
    let (obs, mut timeout_rx, _failure_rx) = recorder(RtxTimerId::T3Rtx);
    let timer = RtxTimer::new(Arc::downgrade(&obs), RtxTimerId::T3Rtx, NO_MAX_RETRANS);

    let started = Instant::now();
    assert!(timer.start(20).await);

    // expirations land at 20, 60 and 140 msec of cumulative backoff
    for expected in 1..=3usize {
        assert_eq!(timeout_rx.recv().await, Some(expected));
    }
    assert!(
        started.elapsed() >= Duration::from_millis(140),
        "three expirations at RTO 20 must take at least 140 msec"
    );

    timer.stop().await;
}

#[tokio::test]
async fn test_rtx_failure_after_limit() {
    let (obs, mut timeout_rx, mut failure_rx) = recorder(RtxTimerId::T1Init);
    let timer = RtxTimer::new(Arc::downgrade(&obs), RtxTimerId::T1Init, 2);

    assert!(timer.start(10).await);
    assert_eq!(failure_rx.recv().await, Some(RtxTimerId::T1Init));
    assert!(!timer.is_running().await, "failure stops the timer");

    // exactly max_retrans expirations were reported first
    assert_eq!(timeout_rx.recv().await, Some(1));
    assert_eq!(timeout_rx.recv().await, Some(2));
    assert!(timeout_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_rtx_unbounded_retries_when_limit_is_zero() {
    let (obs, mut timeout_rx, mut failure_rx) = recorder(RtxTimerId::Reconfig);
    let timer = RtxTimer::new(Arc::downgrade(&obs), RtxTimerId::Reconfig, NO_MAX_RETRANS);

    assert!(timer.start(5).await);
    for expected in 1..=6usize {
        assert_eq!(timeout_rx.recv().await, Some(expected));
    }

    assert!(failure_rx.try_recv().is_err(), "must never report failure");
    assert!(timer.is_running().await);

    timer.stop().await;
    assert!(!timer.is_running().await);
}

#[tokio::test]
async fn test_rtx_first_start_wins_until_stopped() {
    let (obs, mut timeout_rx, _failure_rx) = recorder(RtxTimerId::T2Shutdown);
    let timer = RtxTimer::new(Arc::downgrade(&obs), RtxTimerId::T2Shutdown, PATH_MAX_RETRANS);

    assert!(timer.start(40).await);
    assert!(!timer.start(1).await, "re-arm while running is ignored");
    timer.stop().await;
    timer.stop().await; // a second stop is a no-op

    sleep(Duration::from_millis(100)).await;
    assert!(timeout_rx.try_recv().is_err(), "cancelled arm never fires");

    // reusable after a stop
    assert!(timer.start(10).await);
    assert_eq!(timeout_rx.recv().await, Some(1));
    timer.stop().await;
}
