use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept over the lifetime of an association and reported in the
/// close-time debug log.
#[derive(Default, Debug)]
pub(crate) struct AssociationStats {
    n_datas: AtomicU64,
    n_sacks: AtomicU64,
    n_t3timeouts: AtomicU64,
    n_ack_timeouts: AtomicU64,
    n_fast_retrans: AtomicU64,
}

impl AssociationStats {
    pub(crate) fn inc_datas(&self) {
        self.n_datas.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_sacks(&self) {
        self.n_sacks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_t3timeouts(&self) {
        self.n_t3timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_ack_timeouts(&self) {
        self.n_ack_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_fast_retrans(&self) {
        self.n_fast_retrans.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Display for AssociationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DATA(in)={} SACK(in)={} T3-timeouts={} ack-timeouts={} fast-rtx={}",
            self.n_datas.load(Ordering::SeqCst),
            self.n_sacks.load(Ordering::SeqCst),
            self.n_t3timeouts.load(Ordering::SeqCst),
            self.n_ack_timeouts.load(Ordering::SeqCst),
            self.n_fast_retrans.load(Ordering::SeqCst),
        )
    }
}
