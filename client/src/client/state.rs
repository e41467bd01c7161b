use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Open => 0,
            SessionState::Closing => 1,
            SessionState::Closed => 2,
        }
    }
}

/// Shared session state. Only one caller ever wins the Open -> Closing
/// transition, so teardown runs once no matter how many triggers race.
#[derive(Debug)]
pub struct SessionGuard {
    state: AtomicU8,
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Open.as_u8()),
        }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.get() == SessionState::Open
    }

    /// Returns true for the single caller that moved the session to Closing.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Open.as_u8(),
                SessionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.state
            .store(SessionState::Closed.as_u8(), Ordering::Release);
    }
}
