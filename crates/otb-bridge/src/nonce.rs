use uuid::Uuid;

/// Issues per-transaction nonces: random, never zero, never equal to the
/// previous one.
#[derive(Debug, Default)]
pub struct NonceSource {
    last: i16,
}

impl NonceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose next nonce is guaranteed to differ from `last`.
    pub fn after(last: i16) -> Self {
        Self { last }
    }

    pub fn next_nonce(&mut self) -> i16 {
        loop {
            let candidate = Uuid::new_v4().as_u128() as u16 as i16;
            if candidate != 0 && candidate != self.last {
                self.last = candidate;
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_non_zero_and_never_repeat_back_to_back() {
        let mut src = NonceSource::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let n = src.next_nonce();
            assert_ne!(n, 0);
            assert_ne!(n, prev);
            prev = n;
        }
    }
}
