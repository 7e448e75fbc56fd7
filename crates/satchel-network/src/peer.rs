//! Per-peer connection lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Ready -> (Syncing <-> Idle)
//!       ^              |              |           |          |
//!       +--------------+--------------+-----------+----------+
//! ```
//!
//! Any state may fall back to `Disconnected`. Failed dials and handshakes
//! are retried after an exponentially growing delay until the retry budget
//! runs out.

use crate::config::NetworkConfig;
use crate::protocol::VersionMessage;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Syncing,
    Idle,
}

impl PeerState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Handshaking)
                | (Handshaking, Ready)
                | (Ready, Syncing)
                | (Ready, Idle)
                | (Syncing, Idle)
                | (Idle, Syncing)
        )
    }

    /// Handshake done and the connection is usable for requests.
    pub fn is_usable(self) -> bool {
        matches!(self, PeerState::Ready | PeerState::Syncing | PeerState::Idle)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid peer transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PeerState,
    pub to: PeerState,
}

/// Exponential backoff with a cap and an optional retry budget.
///
/// The delay before retry `n` (zero-based) is `base * 2^n`, clamped to `cap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_retries: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_retries: Option<u32>) -> Self {
        Self { base, cap, max_retries, attempt: 0 }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap, config.max_retries)
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_retries.is_some_and(|max| self.attempt >= max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// What the connection manager should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After(Duration),
    GiveUp,
}

/// Lifecycle record for one logical peer slot.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    state: PeerState,
    backoff: Backoff,
    version: Option<VersionMessage>,
}

impl PeerConnection {
    pub fn new(backoff: Backoff) -> Self {
        Self { state: PeerState::Disconnected, backoff, version: None }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Handshake data, present from `Ready` on.
    pub fn version(&self) -> Option<&VersionMessage> {
        self.version.as_ref()
    }

    /// Best height the peer has announced.
    pub fn best_height(&self) -> u64 {
        self.version.as_ref().map_or(0, |v| v.best_height)
    }

    /// Raise the announced best height, e.g. after the peer relays a newer block.
    pub fn observe_height(&mut self, height: u64) {
        if let Some(v) = self.version.as_mut() {
            v.best_height = v.best_height.max(height);
        }
    }

    pub fn transition(&mut self, next: PeerState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition { from: self.state, to: next });
        }
        if next == PeerState::Disconnected {
            self.version = None;
        }
        self.state = next;
        Ok(())
    }

    /// Handshake accepted: move to `Ready` and forget earlier failures.
    pub fn on_handshake(&mut self, version: VersionMessage) -> Result<(), InvalidTransition> {
        self.transition(PeerState::Ready)?;
        self.version = Some(version);
        self.backoff.reset();
        Ok(())
    }

    /// Dial, handshake or transport failure. Always lands in `Disconnected`.
    pub fn on_failure(&mut self) -> Retry {
        self.state = PeerState::Disconnected;
        self.version = None;
        match self.backoff.next_delay() {
            Some(delay) => Retry::After(delay),
            None => Retry::GiveUp,
        }
    }

    /// The retry budget is spent; the peer should not be used again.
    pub fn is_exhausted(&self) -> bool {
        self.backoff.is_exhausted()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.backoff.attempts()
    }
}
