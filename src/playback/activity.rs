use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Release = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    active: usize,
    on_idle: Option<Release>,
}

/// Counts the users of a shared resource and runs a release step once the
/// last of them is gone.
///
/// Every user holds an `ActivityToken` for as long as it touches the
/// resource. `release_when_idle` either runs the release right away or
/// parks it until the last token drops; it runs exactly once, on the
/// thread that dropped that token.
#[derive(Default)]
pub struct ActivityTracker {
    state: Mutex<State>,
}

/// Keeps its tracker busy until dropped.
pub struct ActivityToken {
    tracker: Arc<ActivityTracker>,
}

impl ActivityTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enter(self: &Arc<Self>) -> ActivityToken {
        self.state().active += 1;
        ActivityToken { tracker: self.clone() }
    }

    pub fn active(&self) -> usize {
        self.state().active
    }

    pub fn has_pending_release(&self) -> bool {
        self.state().on_idle.is_some()
    }

    /// Runs `release` now if no token is out, otherwise when the last one
    /// drops. Returns whether it ran now.
    pub fn release_when_idle(&self, release: impl FnOnce() + Send + 'static) -> bool {
        {
            let mut state = self.state();
            if state.active > 0 {
                if state.on_idle.is_some() {
                    log::warn!("Replacing a pending release");
                }
                state.on_idle = Some(Box::new(release));
                return false;
            }
        }
        release();
        true
    }
}

impl Drop for ActivityToken {
    fn drop(&mut self) {
        let release = {
            let mut state = self.tracker.state();
            state.active = state.active.saturating_sub(1);
            if state.active == 0 {
                state.on_idle.take()
            } else {
                None
            }
        };
        if let Some(release) = release {
            release();
        }
    }
}
