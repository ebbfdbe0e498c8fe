//! Storage capability behind the bucket balance.
//!
//! The bucket never keeps the balance itself: it reads and writes it through a
//! [`TokenLedger`] while holding its own lock, so a backend only has to honour
//! "the last value written is the value read back".

use crate::error::LedgerError;

/// Holds the current token balance of a bucket.
///
/// Implementations may talk to a database or a remote cache; any failure is
/// returned as a [`LedgerError`] and surfaced unchanged by the bucket.
pub trait TokenLedger: Send + Sync {
    /// Returns the current balance.
    fn get_tokens(&self) -> Result<i64, LedgerError>;

    /// Replaces the current balance.
    fn set_tokens(&mut self, tokens: i64) -> Result<(), LedgerError>;
}

/// Process-local ledger. This is the default backend of a bucket.
///
/// # Example
///
/// ```rust
/// use rate_guard_bucket::ledger::{InMemoryTokenLedger, TokenLedger};
///
/// let mut ledger = InMemoryTokenLedger::new(10);
/// assert_eq!(ledger.get_tokens().unwrap(), 10);
///
/// ledger.set_tokens(3).unwrap();
/// assert_eq!(ledger.get_tokens().unwrap(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryTokenLedger {
    tokens: i64,
}

impl InMemoryTokenLedger {
    /// Creates a ledger holding `initial_tokens`.
    pub fn new(initial_tokens: i64) -> Self {
        InMemoryTokenLedger {
            tokens: initial_tokens,
        }
    }
}

impl TokenLedger for InMemoryTokenLedger {
    #[inline]
    fn get_tokens(&self) -> Result<i64, LedgerError> {
        Ok(self.tokens)
    }

    #[inline]
    fn set_tokens(&mut self, tokens: i64) -> Result<(), LedgerError> {
        self.tokens = tokens;
        Ok(())
    }
}
