//! A single in-flight "take one snapshot" request.
//!
//! A request is armed with one [`DischargeTicket`] per trigger path. Each path
//! reports back exactly once by consuming its ticket. The first ticket to
//! [`DischargeTicket::discharge`] while the request still needs action wins
//! and must run the protected action; every other ticket only releases its
//! share. The request state is freed when the last ticket is gone, so a path
//! that never fires (its ticket is dropped) cannot leak it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

/// Receives whether any caller claimed the action.
type ReleaseHook = Box<dyn FnOnce(bool) + Send>;

struct RequestState {
    id: u64,
    need_action: AtomicBool,
    pending: AtomicUsize,
    on_release: parking_lot::Mutex<Option<ReleaseHook>>,
}

impl Drop for RequestState {
    fn drop(&mut self) {
        let claimed = !*self.need_action.get_mut();
        trace!(request = self.id, claimed, "snapshot request released");
        if let Some(hook) = self.on_release.get_mut().take() {
            hook(claimed);
        }
    }
}

pub struct SnapshotRequest {
    state: Arc<RequestState>,
}

impl SnapshotRequest {
    pub fn new(id: u64) -> Self {
        Self {
            state: Arc::new(RequestState {
                id,
                need_action: AtomicBool::new(true),
                pending: AtomicUsize::new(0),
                on_release: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Runs `hook` once, when the request state is freed.
    pub fn on_release(self, hook: impl FnOnce(bool) + Send + 'static) -> Self {
        *self.state.on_release.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Splits the request into one ticket per trigger path.
    pub fn arm(self, triggers: usize) -> Vec<DischargeTicket> {
        self.state.pending.store(triggers, Ordering::Release);
        (0..triggers)
            .map(|_| DischargeTicket {
                state: Some(Arc::clone(&self.state)),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discharge {
    /// This caller won the request and must run the protected action.
    Act,
    /// The action already ran (or will run) elsewhere.
    AlreadyHandled,
}

pub struct DischargeTicket {
    state: Option<Arc<RequestState>>,
}

impl DischargeTicket {
    /// Reports that this trigger fired. Returns [`Discharge::Act`] for exactly
    /// one caller per request.
    pub fn discharge(mut self) -> Discharge {
        if self.consume(true) {
            Discharge::Act
        } else {
            Discharge::AlreadyHandled
        }
    }

    /// Reports that this trigger will never fire, without claiming the action.
    pub fn cancel(mut self) {
        self.consume(false);
    }

    fn consume(&mut self, claim: bool) -> bool {
        let Some(state) = self.state.take() else {
            return false;
        };
        let need_action = claim && state.need_action.swap(false, Ordering::AcqRel);
        let remaining = state.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        trace!(
            request = state.id,
            remaining,
            need_action,
            claim,
            "snapshot request discharged"
        );
        need_action
    }
}

impl Drop for DischargeTicket {
    fn drop(&mut self) {
        if self.state.is_some() {
            trace!("discharge ticket dropped without firing");
            self.consume(false);
        }
    }
}
