//! Cancellable reader/writer lock for the stdin resource.
//!
//! The engine treats the process stdin as a table that can be consumed at
//! most once, so replacing the stream must exclude every concurrent read
//! of it. `StdinLocker` is a manual, non-fair lock: acquisition polls with
//! a fixed retry delay until the hold is granted or the caller's
//! `CancelToken` fires. There is no fairness: a continuous stream of
//! shared holders can starve a pending exclusive acquirer. There is also
//! no reentrancy and no upgrade path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::view::STDIN_TABLE_NAME;
use crate::error::{Result, SessionError};

/// Delay between acquisition attempts on a contended lock.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Cooperative cancellation signal with an optional deadline.
///
/// Clones share the cancellation flag, so one handle can be given to a
/// blocking acquisition while another thread fires it. A token without a
/// deadline never fires on its own.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires on its own.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// A token that fires once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        CancelToken::with_deadline(Instant::now() + timeout)
    }

    /// A token that fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Fire the token. Every clone observes the cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token was cancelled or its deadline has passed.
    pub fn fired(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.map_or(false, |d| d <= Instant::now())
    }

    /// Time left until the deadline, if one is set.
    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Default)]
struct LockState {
    /// An exclusive hold is outstanding.
    locked: bool,
    /// Number of shared holds outstanding. Never positive while `locked`.
    rlock_count: u32,
}

/// Manual reader/writer lock over the stdin stream.
///
/// An exclusive hold excludes every other hold; any number of shared holds
/// may coexist while no exclusive hold is outstanding.
pub struct StdinLocker {
    state: Mutex<LockState>,
}

impl StdinLocker {
    pub fn new() -> Self {
        StdinLocker {
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquire the exclusive hold, waiting indefinitely.
    pub fn lock(&self) -> Result<()> {
        self.lock_context(&CancelToken::new())
    }

    /// Acquire the exclusive hold, failing with `LockTimeout` if `token`
    /// fires before the hold is granted.
    pub fn lock_context(&self, token: &CancelToken) -> Result<()> {
        self.acquire(token, StdinLocker::try_lock)
    }

    /// Release the exclusive hold.
    ///
    /// Fails with `LockMisuse` when no exclusive hold is outstanding; the
    /// lock state is left untouched in that case.
    pub fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            state.locked = false;
            Ok(())
        } else {
            Err(SessionError::LockMisuse)
        }
    }

    /// Acquire a shared hold, waiting indefinitely.
    pub fn rlock(&self) -> Result<()> {
        self.rlock_context(&CancelToken::new())
    }

    /// Acquire a shared hold, failing with `LockTimeout` if `token` fires
    /// before the hold is granted.
    pub fn rlock_context(&self, token: &CancelToken) -> Result<()> {
        self.acquire(token, StdinLocker::try_rlock)
    }

    /// Release one shared hold.
    ///
    /// Fails with `LockMisuse` when no shared hold is outstanding.
    pub fn runlock(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.rlock_count > 0 {
            state.rlock_count -= 1;
            Ok(())
        } else {
            Err(SessionError::LockMisuse)
        }
    }

    fn try_lock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.locked || state.rlock_count > 0 {
            return false;
        }
        state.locked = true;
        true
    }

    fn try_rlock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return false;
        }
        state.rlock_count += 1;
        true
    }

    /// Poll `attempt` until it grants a hold or `token` fires.
    ///
    /// An already-fired token is reported before any wait. Acquisition is
    /// all-or-nothing: a timeout leaves no partial hold behind.
    fn acquire(&self, token: &CancelToken, attempt: fn(&StdinLocker) -> bool) -> Result<()> {
        if token.fired() {
            return Err(SessionError::LockTimeout {
                resource: STDIN_TABLE_NAME.to_string(),
            });
        }

        loop {
            if attempt(self) {
                return Ok(());
            }

            let delay = match token.remaining() {
                Some(remaining) => RETRY_DELAY.min(remaining),
                None => RETRY_DELAY,
            };
            thread::sleep(delay);

            if token.fired() {
                debug!(resource = STDIN_TABLE_NAME, "lock wait timed out");
                return Err(SessionError::LockTimeout {
                    resource: STDIN_TABLE_NAME.to_string(),
                });
            }
        }
    }
}

impl Default for StdinLocker {
    fn default() -> Self {
        StdinLocker::new()
    }
}
