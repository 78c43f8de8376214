//! Reconnect supervisor
//!
//! A small state machine owned by each transport worker:
//!
//! ```text
//! Idle -> Connecting -> Connected
//! Connected | Connecting --(error)--> AwaitingReconnect -> Connecting
//! ```
//!
//! There is no give-up state. Only one reconnect can be armed at a time: a
//! second `on_disconnected` while a delay is pending returns `None`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// `first` before the first attempt after a loss, `then` for the rest.
    Stepped { first: Duration, then: Duration },
    /// `initial * multiplier^n`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: u32,
    },
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(d) => d,
            BackoffPolicy::Stepped { first, then } => {
                if attempt <= 1 {
                    first
                } else {
                    then
                }
            }
            BackoffPolicy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(31);
                let factor = multiplier.max(1).saturating_pow(exp);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
    AwaitingReconnect { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    policy: BackoffPolicy,
    state: SupervisorState,
    attempts: u32,
}

impl ReconnectSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: SupervisorState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Move to `Connecting`. Returns false if a connect is already underway
    /// or established.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            SupervisorState::Connecting | SupervisorState::Connected => false,
            SupervisorState::Idle | SupervisorState::AwaitingReconnect { .. } => {
                self.state = SupervisorState::Connecting;
                true
            }
        }
    }

    pub fn on_connected(&mut self) {
        self.state = SupervisorState::Connected;
        self.attempts = 0;
    }

    /// Arm the reconnect timer after a failure or connection loss. Returns
    /// the delay to wait, or `None` if a reconnect is already armed.
    pub fn on_disconnected(&mut self) -> Option<Duration> {
        if let SupervisorState::AwaitingReconnect { .. } = self.state {
            return None;
        }
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.policy.delay(self.attempts);
        self.state = SupervisorState::AwaitingReconnect {
            attempt: self.attempts,
            delay,
        };
        Some(delay)
    }

    /// The armed delay elapsed; start the next attempt.
    pub fn fire(&mut self) -> bool {
        match self.state {
            SupervisorState::AwaitingReconnect { .. } => {
                self.state = SupervisorState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Back to `Idle` (explicit disconnect).
    pub fn reset(&mut self) {
        self.state = SupervisorState::Idle;
        self.attempts = 0;
    }
}
