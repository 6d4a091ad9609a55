use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Duration;

/// Delayed-ack interval (RFC 4960 section 6.2: within 200ms).
pub(crate) const ACK_INTERVAL: Duration = Duration::from_millis(200);

#[async_trait]
pub(crate) trait AckTimerObserver {
    async fn on_ack_timeout(&mut self);
}

/// One-shot timer backing delayed acknowledgement.
///
/// The pending expiration is a spawned task holding a cancel receiver;
/// dropping the sender half (on `stop` or when the timer itself is
/// dropped) silences it. The observer is held weakly so a dropped
/// association silences a late timeout too.
#[derive(Default, Debug)]
pub(crate) struct AckTimer<T: 'static + AckTimerObserver + Send> {
    pub(crate) timeout_observer: Weak<Mutex<T>>,
    pub(crate) interval: Duration,
    cancel: Option<oneshot::Sender<()>>,
}

impl<T: 'static + AckTimerObserver + Send> AckTimer<T> {
    pub(crate) fn new(timeout_observer: Weak<Mutex<T>>, interval: Duration) -> Self {
        AckTimer {
            timeout_observer,
            interval,
            cancel: None,
        }
    }

    /// Arms the timer. Returns false while it is already armed.
    pub(crate) fn start(&mut self) -> bool {
        if self.cancel.is_some() {
            return false;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let interval = self.interval;
        let observer = self.timeout_observer.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Some(observer) = observer.upgrade() {
                        observer.lock().await.on_ack_timeout().await;
                    }
                }
                _ = cancel_rx => {}
            }
        });

        self.cancel = Some(cancel_tx);
        true
    }

    /// Disarms the timer; a later start re-arms it.
    pub(crate) fn stop(&mut self) {
        self.cancel.take();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.cancel.is_some()
    }
}
