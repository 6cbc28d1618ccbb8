use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Where a self-healing [`Connection`] or [`Channel`] stands.
///
/// `Connecting -> Open -> (Closed -> Connecting)* -> Terminated`. `Terminated` is only ever
/// reached through an explicit close or the shutdown signal and is never left.
///
/// [`Connection`]: ./struct.Connection.html
/// [`Channel`]: ./struct.Channel.html
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Connecting,
    Open,
    Closed,
    Terminated,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Connecting,
            1 => State::Open,
            2 => State::Closed,
            _ => State::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            State::Connecting => 0,
            State::Open => 1,
            State::Closed => 2,
            State::Terminated => 3,
        }
    }
}

/// Lock-free liveness flag: written by the owning reconnection loop, read by everyone else.
#[derive(Clone, Default)]
pub(crate) struct Status(Arc<AtomicU8>);

impl Status {
    pub(crate) fn state(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn open(&self) -> bool {
        self.state() == State::Open
    }

    /// Moves to `state` unless already terminated. Returns whether the transition happened.
    pub(crate) fn set_state(&self, state: State) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if State::from_u8(current) == State::Terminated {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                state.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Latches `Terminated`. Only the first caller gets `true` and owns the teardown.
    pub(crate) fn terminate(&self) -> bool {
        self.0.swap(State::Terminated.as_u8(), Ordering::AcqRel) != State::Terminated.as_u8()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Status").field(&self.state()).finish()
    }
}
