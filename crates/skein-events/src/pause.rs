use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct PauseState {
    pause: bool,
    paused: bool,
    torn_down: bool,
}

/// Two-event exclusivity handshake between a requester needing exclusive
/// stdout and a rendering (animation) thread.
///
/// Protocol: the requester sets `pause`; the animator observes it at the
/// top of each iteration, sets `paused`, and sleeps until `pause` clears;
/// the requester waits for `paused` before doing exclusive I/O, then clears
/// `paused` and `pause`. Teardown clears both and releases all waiters.
pub struct PauseHandshake {
    state: Mutex<PauseState>,
    cond: Condvar,
}

impl Default for PauseHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseHandshake {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PauseState::default()),
            cond: Condvar::new(),
        }
    }

    /// Request the pause and wait for the animator to acknowledge.
    ///
    /// Returns true once `paused` was observed; false if the animator did
    /// not acknowledge within `timeout` (the caller may proceed without
    /// exclusivity at its own discretion).
    pub fn request_pause(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("pause lock");
        state.pause = true;
        self.cond.notify_all();
        while !state.paused && !state.torn_down {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("pause lock");
            state = guard;
        }
        state.paused
    }

    /// Release the pause after exclusive I/O: clears `paused`, then `pause`.
    pub fn release_pause(&self) {
        let mut state = self.state.lock().expect("pause lock");
        state.paused = false;
        state.pause = false;
        self.cond.notify_all();
    }

    /// Animator-side checkpoint, called at the top of each rendering
    /// iteration. If a pause is requested, acknowledges it and blocks until
    /// released. Returns false once the handshake is torn down.
    pub fn animator_checkpoint(&self) -> bool {
        let mut state = self.state.lock().expect("pause lock");
        if state.torn_down {
            return false;
        }
        if state.pause {
            state.paused = true;
            self.cond.notify_all();
            while state.pause && !state.torn_down {
                state = self.cond.wait(state).expect("pause lock");
            }
        }
        !state.torn_down
    }

    /// Whether a pause request is currently set (animator-side poll).
    pub fn pause_requested(&self) -> bool {
        self.state.lock().expect("pause lock").pause
    }

    /// Clear both events and release all waiters.
    pub fn teardown(&self) {
        let mut state = self.state.lock().expect("pause lock");
        state.pause = false;
        state.paused = false;
        state.torn_down = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn spawn_animator(
        handshake: Arc<PauseHandshake>,
        frames: Arc<AtomicUsize>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while handshake.animator_checkpoint() {
                frames.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
            }
        })
    }

    #[test]
    fn test_animator_stops_writing_while_paused() {
        let handshake = Arc::new(PauseHandshake::new());
        let frames = Arc::new(AtomicUsize::new(0));
        let animator = spawn_animator(handshake.clone(), frames.clone());

        thread::sleep(Duration::from_millis(30));
        assert!(frames.load(Ordering::SeqCst) > 0);

        assert!(handshake.request_pause(Duration::from_secs(2)));
        let at_pause = frames.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(frames.load(Ordering::SeqCst), at_pause);

        handshake.release_pause();
        thread::sleep(Duration::from_millis(50));
        assert!(frames.load(Ordering::SeqCst) > at_pause);

        handshake.teardown();
        animator.join().unwrap();
    }

    #[test]
    fn test_request_pause_times_out_without_animator() {
        let handshake = PauseHandshake::new();
        let start = Instant::now();
        assert!(!handshake.request_pause(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_multiple_pause_resume_cycles() {
        let handshake = Arc::new(PauseHandshake::new());
        let frames = Arc::new(AtomicUsize::new(0));
        let animator = spawn_animator(handshake.clone(), frames.clone());

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(20));
            assert!(handshake.request_pause(Duration::from_secs(2)));
            let at_pause = frames.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            assert_eq!(frames.load(Ordering::SeqCst), at_pause);
            handshake.release_pause();
        }

        handshake.teardown();
        animator.join().unwrap();
    }

    #[test]
    fn test_teardown_releases_paused_animator() {
        let handshake = Arc::new(PauseHandshake::new());
        let frames = Arc::new(AtomicUsize::new(0));
        let animator = spawn_animator(handshake.clone(), frames.clone());

        thread::sleep(Duration::from_millis(20));
        assert!(handshake.request_pause(Duration::from_secs(2)));
        handshake.teardown();
        animator.join().unwrap();
    }
}
