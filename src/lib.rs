//! A token bucket for throttling operations inside a larger service.
//!
//! The bucket keeps an integer balance bounded by a capacity. Callers withdraw
//! tokens, the number of tokens an operation costs is computed by a pluggable
//! strategy, and background refill sources put tokens back over time.
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use rate_guard_bucket::{Bucket, ConsumeArgs, TimeRefiller};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! // 100 tokens, 10 more every second
//! let bucket = Bucket::builder(100)
//!     .with_refiller(TimeRefiller::new(10, Duration::from_secs(1)).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let cancel = CancellationToken::new();
//! bucket.start(cancel.clone()).unwrap();
//!
//! match bucket.consume(&ConsumeArgs::Null) {
//!     Ok(true) => println!("Request allowed"),
//!     Ok(false) => println!("Request rate limited"),
//!     Err(e) => println!("Request failed: {}", e),
//! }
//!
//! cancel.cancel();
//! bucket.stop().unwrap();
//! # }
//! ```
//!
//! # Components
//!
//! ## [Ledger](ledger::TokenLedger)
//! Where the balance lives. [`InMemoryTokenLedger`] is the default; any
//! backend offering "read balance" and "write balance" can be plugged in.
//!
//! ## [Consume strategies](consume_strategy::ConsumeStrategy)
//! How many tokens an operation costs:
//! ```rust
//! # use rate_guard_bucket::{DynamicConsume, StaticConsume};
//! let per_call = StaticConsume::new(1).unwrap(); // every call costs 1
//! let per_byte = DynamicConsume::new();          // the caller passes the cost
//! ```
//! [`RuleConsume`] picks the cost from a list of predicates over the call
//! arguments, evaluated by [`evalexpr`] when the `expr` feature is on.
//!
//! ## [Refillers](refiller::Refiller)
//! Background producers of tokens. [`TimeRefiller`] adds a fixed amount every
//! interval, [`ManualRefiller`] refills on demand.
//!
//! ## [Bucket](bucket::Bucket)
//! Owns the ledger behind one readers-writer lock and applies queued refills
//! through a single aggregator task.
//!
//! # Error Handling
//! - Running out of tokens is `Ok(false)`, never an error
//! - [`ConfigError`] - invalid construction parameters
//! - [`Error::Strategy`] - the cost could not be computed, nothing was deducted
//! - [`Error::Ledger`] - the storage backend failed
//! - [`Error::Refill`] - one or more refillers failed to start or stop
//!
//! # Shutdown
//! Cancel the token passed to [`Bucket::start`] to end every background task.
//! [`Bucket::stop`] only stops the refillers.

pub mod bucket;
pub mod consume_strategy;
pub mod error;
pub mod ledger;
pub mod predicate;
pub mod refiller;

pub use bucket::{Bucket, BucketBuilder, BucketConfig, DEFAULT_QUEUE_CAPACITY};
pub use consume_strategy::{
    ConsumeArgs, ConsumeRule, ConsumeStrategy, DynamicConsume, RuleConsume, StaticConsume,
};
pub use error::{ConfigError, Error, LedgerError, MultiError, RefillError, StrategyError};
pub use ledger::{InMemoryTokenLedger, TokenLedger};
pub use refiller::{ManualRefiller, Refiller, TimeRefiller, TimeRefillerConfig};
