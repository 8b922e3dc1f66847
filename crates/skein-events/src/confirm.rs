use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::EventError;

/// Details of the outstanding confirmation, for UIs that render a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub round_id: String,
    pub post_id: String,
    pub code: String,
}

#[derive(Default)]
struct GateState {
    pending: Option<PendingConfirmation>,
    decision: Option<bool>,
    torn_down: bool,
}

/// Blocking request/response handshake between a worker thread and the UI
/// thread. At most one request may be outstanding per session.
pub struct ConfirmationGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Claim the gate for a new request. Fails with `ConfirmationBusy` if a
    /// request is already outstanding, `ConfirmationCancelled` after
    /// teardown.
    pub fn begin(&self, round_id: &str, post_id: &str, code: &str) -> Result<(), EventError> {
        let mut state = self.state.lock().expect("gate lock");
        if state.torn_down {
            return Err(EventError::ConfirmationCancelled);
        }
        if state.pending.is_some() {
            return Err(EventError::ConfirmationBusy);
        }
        state.pending = Some(PendingConfirmation {
            round_id: round_id.to_string(),
            post_id: post_id.to_string(),
            code: code.to_string(),
        });
        state.decision = None;
        Ok(())
    }

    /// Block until a decision arrives, the gate is cancelled, or `timeout`
    /// elapses. Clears the outstanding request before returning.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, EventError> {
        let mut state = self.state.lock().expect("gate lock");
        loop {
            if let Some(decision) = state.decision.take() {
                state.pending = None;
                return Ok(decision);
            }
            if state.torn_down {
                state.pending = None;
                return Err(EventError::ConfirmationCancelled);
            }
            state = match timeout {
                Some(limit) => {
                    let (guard, wait_result) = self
                        .cond
                        .wait_timeout(state, limit)
                        .expect("gate lock");
                    if wait_result.timed_out() && guard.decision.is_none() && !guard.torn_down {
                        let mut guard = guard;
                        guard.pending = None;
                        return Err(EventError::ConfirmationTimeout);
                    }
                    guard
                }
                None => self.cond.wait(state).expect("gate lock"),
            };
        }
    }

    /// Store the decision and wake the waiting worker. A decision without an
    /// outstanding request is ignored.
    pub fn provide(&self, approved: bool) {
        let mut state = self.state.lock().expect("gate lock");
        if state.pending.is_none() {
            tracing::debug!("confirmation decision with no outstanding request; ignoring");
            return;
        }
        state.decision = Some(approved);
        self.cond.notify_all();
    }

    /// Tear the gate down: the outstanding request (and any future one)
    /// resolves to cancelled.
    pub fn cancel(&self) {
        let mut state = self.state.lock().expect("gate lock");
        state.torn_down = true;
        self.cond.notify_all();
    }

    pub fn pending(&self) -> Option<PendingConfirmation> {
        self.state.lock().expect("gate lock").pending.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn request_on_thread(
        gate: Arc<ConfirmationGate>,
        timeout: Option<Duration>,
    ) -> thread::JoinHandle<Result<bool, EventError>> {
        thread::spawn(move || {
            gate.begin("round-1", "post-1", "print('hi')")?;
            gate.wait(timeout)
        })
    }

    fn wait_for_pending(gate: &ConfirmationGate) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while gate.pending().is_none() {
            assert!(Instant::now() < deadline, "request never became pending");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_approved_decision_reaches_worker() {
        let gate = Arc::new(ConfirmationGate::new());
        let worker = request_on_thread(gate.clone(), None);
        wait_for_pending(&gate);
        assert_eq!(gate.pending().unwrap().code, "print('hi')");
        gate.provide(true);
        assert_eq!(worker.join().unwrap().unwrap(), true);
        assert!(gate.pending().is_none());
    }

    #[test]
    fn test_denied_decision_reaches_worker() {
        let gate = Arc::new(ConfirmationGate::new());
        let worker = request_on_thread(gate.clone(), None);
        wait_for_pending(&gate);
        gate.provide(false);
        assert_eq!(worker.join().unwrap().unwrap(), false);
    }

    #[test]
    fn test_second_request_is_busy() {
        let gate = Arc::new(ConfirmationGate::new());
        let worker = request_on_thread(gate.clone(), None);
        wait_for_pending(&gate);
        assert!(matches!(
            gate.begin("round-1", "post-2", "ls"),
            Err(EventError::ConfirmationBusy)
        ));
        gate.provide(true);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_cancel_resolves_outstanding_request() {
        let gate = Arc::new(ConfirmationGate::new());
        let worker = request_on_thread(gate.clone(), None);
        wait_for_pending(&gate);
        gate.cancel();
        assert!(matches!(
            worker.join().unwrap(),
            Err(EventError::ConfirmationCancelled)
        ));
        // The gate stays cancelled after teardown.
        assert!(matches!(
            gate.begin("round-2", "post-2", "x"),
            Err(EventError::ConfirmationCancelled)
        ));
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let gate = Arc::new(ConfirmationGate::new());
        let worker = request_on_thread(gate.clone(), Some(Duration::from_millis(50)));
        assert!(matches!(
            worker.join().unwrap(),
            Err(EventError::ConfirmationTimeout)
        ));
        assert!(gate.pending().is_none());
    }

    #[test]
    fn test_decision_without_request_is_ignored() {
        let gate = ConfirmationGate::new();
        gate.provide(true);
        assert!(gate.pending().is_none());
    }
}
