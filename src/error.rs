//! error.rs
//! Error types for bucket construction, consume evaluation, ledger access and refill sources.

use std::fmt;

/// Boxed error returned by ledger backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Construction-time errors. A value that fails with one of these is never usable.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A static or rule cost is below zero.
    #[error("tokens to consume should be positive or zero, got {cost}")]
    NegativeCost {
        /// The rejected cost.
        cost: i64,
    },

    /// The bucket capacity is below zero.
    #[error("bucket capacity should be positive or zero, got {capacity}")]
    NegativeCapacity {
        /// The rejected capacity.
        capacity: i64,
    },

    /// The refill queue must hold at least one pending quantity.
    #[error("refill queue capacity must be greater than zero")]
    ZeroQueueCapacity,

    /// A time refiller cannot tick on a zero interval.
    #[error("refill interval must be greater than zero")]
    ZeroRefillInterval,

    /// A time refiller cannot remove tokens.
    #[error("refill rate should be positive or zero, got {rate}")]
    NegativeRefillRate {
        /// The rejected rate.
        rate: i64,
    },

    /// The predicate engine rejected a rule expression.
    #[error("invalid predicate `{expression}`: {source}")]
    InvalidPredicate {
        /// Source text of the predicate.
        expression: String,
        /// Error reported by the predicate engine.
        #[source]
        source: BoxError,
    },

    /// The rule expression is a constant that does not produce a boolean.
    #[error("predicate `{expression}` does not evaluate to a boolean")]
    NonBooleanPredicate {
        /// Source text of the predicate.
        expression: String,
    },
}

/// Per-call errors raised while computing the cost of an operation.
#[derive(thiserror::Error, Debug)]
pub enum StrategyError {
    /// The dynamic strategy received something other than an `i64`.
    #[error("consume strategy argument is not an integer")]
    ArgumentNotInteger,

    /// The computed cost is below zero.
    #[error("tokens to consume should be positive or zero, got {cost}")]
    NegativeCost {
        /// The rejected cost.
        cost: i64,
    },

    /// No rule predicate evaluated to `true`.
    #[error("no expression matched")]
    NoRuleMatched,

    /// The predicate engine failed while evaluating a rule.
    #[error("failed to evaluate predicate `{expression}`: {source}")]
    Evaluation {
        /// Source text of the predicate.
        expression: String,
        /// Error reported by the predicate engine.
        #[source]
        source: BoxError,
    },
}

/// Failure reported by a [`TokenLedger`](crate::ledger::TokenLedger) backend.
///
/// The backend error is kept as-is and displayed transparently.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct LedgerError(#[from] BoxError);

impl LedgerError {
    /// Wraps any backend error.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        LedgerError(error.into())
    }

    /// Returns the backend error.
    pub fn into_inner(self) -> BoxError {
        self.0
    }
}

/// Errors raised by refill sources.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefillError {
    /// The refiller left the idle state; it cannot be started twice or after a stop.
    #[error("refiller was already started or stopped")]
    AlreadyStarted,

    /// Background refill tasks need a tokio runtime.
    #[error("refiller must be started from within a tokio runtime")]
    NoRuntime,

    /// The refiller is not running.
    #[error("refiller is not running")]
    NotRunning,

    /// Refill quantities must not remove tokens.
    #[error("refill quantity should be positive or zero, got {quantity}")]
    NegativeQuantity {
        /// The rejected quantity.
        quantity: i64,
    },

    /// The refill queue has no free slot.
    #[error("refill queue is full")]
    QueueFull,

    /// The bucket side of the refill queue is gone.
    #[error("refill queue is closed")]
    QueueClosed,
}

/// Every refiller failure collected while starting or stopping a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<RefillError>,
}

impl MultiError {
    pub(crate) fn push(&mut self, error: RefillError) {
        self.errors.push(error);
    }

    pub(crate) fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// The collected errors, in refiller order.
    pub fn errors(&self) -> &[RefillError] {
        &self.errors
    }

    /// Consumes the container and returns the collected errors.
    pub fn into_errors(self) -> Vec<RefillError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no refiller errors"),
            [single] => write!(f, "{}", single),
            errors => {
                write!(f, "{} refillers failed: ", errors.len())?;
                for (idx, error) in errors.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl IntoIterator for MultiError {
    type Item = RefillError;
    type IntoIter = std::vec::IntoIter<RefillError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

/// Errors returned by [`Bucket`](crate::bucket::Bucket) operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The consume strategy could not compute a cost; the balance is untouched.
    #[error(transparent)]
    Strategy(#[from] StrategyError),

    /// The ledger backend failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// One or more refillers failed to start or stop.
    #[error(transparent)]
    Refill(#[from] MultiError),

    /// `start` was already called on this bucket.
    #[error("bucket was already started")]
    AlreadyStarted,

    /// `start` was called outside a tokio runtime.
    #[error("bucket must be started from within a tokio runtime")]
    NoRuntime,
}
