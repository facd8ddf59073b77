//! Links the two loops.
//!
//! Either loop reports a fatal error through `fail`. The first error is
//! kept, the shared token is cancelled, and every registered waker runs so
//! a loop blocked in its channel wakes up and sees the token.

use rcm_core::cancel::CancellationToken;
use rcm_core::error::FabricError;

use std::sync::{Mutex, MutexGuard};

type Waker = Box<dyn Fn() + Send + Sync>;

struct State {
    error: Option<FabricError>,
    finished: bool,
    wakers: Vec<Waker>,
}

pub struct Supervisor {
    token: CancellationToken,
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Mutex::new(State {
                error: None,
                finished: false,
                wakers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Add a wake-up for a blocking wait. Runs at once if the loops are
    /// already stopping.
    pub fn register_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        let mut st = self.lock();
        if st.finished || self.token.is_cancelled() {
            drop(st);
            waker();
            return;
        }
        st.wakers.push(Box::new(waker));
    }

    /// Record a fatal error and stop both loops. Later errors are logged
    /// and dropped.
    pub fn fail(&self, err: FabricError) {
        {
            let mut st = self.lock();
            if st.error.is_some() {
                log::debug!("supervisor: ignoring follow-up error: {}", err);
                return;
            }
            log::error!("fatal: {}", err);
            st.error = Some(err);
        }
        self.token.cancel();
        self.wake_all();
    }

    /// Stop both loops without an error.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.wake_all();
    }

    fn wake_all(&self) {
        let wakers = std::mem::take(&mut self.lock().wakers);
        for wake in &wakers {
            wake();
        }
    }

    /// The recorded fatal error, if any.
    pub fn take_error(&self) -> Option<FabricError> {
        self.lock().error.take()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_first_error_wins() {
        let sup = Supervisor::new();
        sup.fail(FabricError::UnknownEvent(13));
        sup.fail(FabricError::call("ibv_post_send", "late"));
        assert!(sup.is_cancelled());
        assert!(matches!(sup.take_error(), Some(FabricError::UnknownEvent(13))));
        assert!(sup.take_error().is_none());
    }

    #[test]
    fn test_wakers_run_once() {
        let sup = Supervisor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        sup.register_waker(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sup.fail(FabricError::UnknownEvent(7));
        sup.finish();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_waker_runs_immediately() {
        let sup = Supervisor::new();
        sup.finish();
        assert!(!sup.is_cancelled());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        sup.register_waker(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
