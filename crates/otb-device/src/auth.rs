//! Start-request authentication.
//!
//! # Invariants
//!
//! - The key is compared before the nonce. A wrong key is refused whatever
//!   nonce it carries, and the nonce is not recorded.
//! - A nonce is recorded only when the request is accepted.
//! - The guard remembers the last `window` accepted nonces (at least one).
//!   The initial history is `[0]`, so nonce 0 is never accepted.
//!
//! All logic is pure: no IO, no clock.

use std::collections::VecDeque;

use crate::Rejection;

#[derive(Debug, Clone)]
pub struct AuthGuard {
    key: i16,
    window: usize,
    accepted: VecDeque<i16>,
}

impl AuthGuard {
    /// `window` is clamped to at least 1.
    pub fn new(key: i16, window: usize) -> Self {
        let window = window.max(1);
        let mut accepted = VecDeque::with_capacity(window);
        accepted.push_back(0);
        Self {
            key,
            window,
            accepted,
        }
    }

    /// Check `key` and `nonce`; on success the nonce joins the history.
    pub fn admit(&mut self, key: i16, nonce: i16) -> Result<(), Rejection> {
        if key != self.key {
            return Err(Rejection::WrongKey);
        }
        if self.accepted.contains(&nonce) {
            return Err(Rejection::ReplayedNonce(nonce));
        }
        if self.accepted.len() == self.window {
            self.accepted.pop_front();
        }
        self.accepted.push_back(nonce);
        Ok(())
    }

    /// Most recently accepted nonce (0 before the first admission).
    pub fn last_nonce(&self) -> i16 {
        self.accepted.back().copied().unwrap_or(0)
    }
}
