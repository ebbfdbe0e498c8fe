use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consume_strategy::{ConsumeArgs, ConsumeStrategy, StaticConsume};
use crate::error::{ConfigError, Error, MultiError, StrategyError};
use crate::ledger::{InMemoryTokenLedger, TokenLedger};
use crate::refiller::Refiller;

/// Number of pending refill quantities a bucket buffers by default.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Token bucket engine.
///
/// The bucket owns a [`TokenLedger`] behind a single readers-writer lock. Callers
/// withdraw tokens with [`consume`](Self::consume); the cost of each operation is
/// decided by the configured [`ConsumeStrategy`]. Tokens come back either through
/// [`add_tokens`](Self::add_tokens) or through [`Refiller`]s, whose quantities are
/// queued and applied one at a time by a single background aggregator.
///
/// # Behavior
///
/// - The balance never leaves `[0, capacity]`
/// - A consume either deducts its whole cost or nothing
/// - Running out of tokens is reported as `Ok(false)`, not as an error
/// - Refills above capacity are discarded
///
/// # Example
///
/// ```rust
/// use rate_guard_bucket::bucket::Bucket;
/// use rate_guard_bucket::consume_strategy::{ConsumeArgs, DynamicConsume};
///
/// let bucket = Bucket::builder(10)
///     .with_consume_strategy(DynamicConsume::new())
///     .build()
///     .unwrap();
///
/// assert!(bucket.consume(&ConsumeArgs::from(7)).unwrap());
/// // Only 3 left
/// assert!(!bucket.consume(&ConsumeArgs::from(4)).unwrap());
/// assert_eq!(bucket.available_tokens().unwrap(), 3);
/// ```
pub struct Bucket {
    inner: Arc<BucketInner>,
    refillers: Vec<Arc<dyn Refiller>>,
    queue: mpsc::Sender<i64>,
    /// Taken by the aggregator on start.
    receiver: Mutex<Option<mpsc::Receiver<i64>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between callers and the aggregator task.
struct BucketInner {
    capacity: i64,
    ledger: RwLock<Box<dyn TokenLedger>>,
    consume_strategy: Box<dyn ConsumeStrategy>,
}

impl BucketInner {
    fn available_tokens(&self) -> Result<i64, Error> {
        let ledger = self.ledger.read();
        Ok(ledger.get_tokens()?)
    }

    fn consume(&self, args: &ConsumeArgs) -> Result<bool, Error> {
        let mut ledger = self.ledger.write();

        let tokens = self.consume_strategy.tokens_to_consume(args)?;
        if tokens < 0 {
            return Err(StrategyError::NegativeCost { cost: tokens }.into());
        }

        let available = ledger.get_tokens()?;
        if tokens > available {
            return Ok(false);
        }

        ledger.set_tokens(available - tokens)?;
        Ok(true)
    }

    fn add_tokens(&self, tokens: i64) -> Result<(), Error> {
        let mut ledger = self.ledger.write();

        let available = ledger.get_tokens()?;
        let refilled = available.saturating_add(tokens).min(self.capacity);

        ledger.set_tokens(refilled)?;
        Ok(())
    }
}

impl Bucket {
    /// Creates a full bucket with the default in-memory ledger, a cost of one
    /// token per consume and no refillers.
    ///
    /// # Errors
    /// [`ConfigError::NegativeCapacity`] if `capacity < 0`.
    pub fn new(capacity: i64) -> Result<Self, ConfigError> {
        BucketBuilder::new(capacity).build()
    }

    /// Starts configuring a bucket holding at most `capacity` tokens.
    pub fn builder(capacity: i64) -> BucketBuilder {
        BucketBuilder::new(capacity)
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> i64 {
        self.inner.capacity
    }

    /// Returns the current balance.
    ///
    /// # Errors
    /// [`Error::Ledger`] if the ledger cannot be read.
    #[inline]
    pub fn available_tokens(&self) -> Result<i64, Error> {
        self.inner.available_tokens()
    }

    /// Attempts to withdraw the cost of the operation described by `args`.
    ///
    /// Cost evaluation, balance check and withdrawal happen under one exclusive
    /// lock, so concurrent consumes and refills never interleave.
    ///
    /// # Returns
    /// * `Ok(true)` - The cost was deducted
    /// * `Ok(false)` - Not enough tokens; the balance is unchanged
    /// * `Err(Error::Strategy)` - The cost could not be computed; the balance is unchanged
    /// * `Err(Error::Ledger)` - The ledger failed
    #[inline]
    pub fn consume(&self, args: &ConsumeArgs) -> Result<bool, Error> {
        self.inner.consume(args)
    }

    /// Adds `tokens` to the balance, discarding anything above capacity.
    ///
    /// The bucket does not reject negative amounts; refillers validate their
    /// quantities before queueing them.
    ///
    /// # Errors
    /// [`Error::Ledger`] if the ledger fails.
    #[inline]
    pub fn add_tokens(&self, tokens: i64) -> Result<(), Error> {
        self.inner.add_tokens(tokens)
    }

    /// Spawns the refill aggregator and starts every refiller.
    ///
    /// The aggregator lives until `cancel` is cancelled; every refiller receives
    /// the same token. All refillers are attempted even if some fail, and every
    /// failure is reported in the returned [`MultiError`].
    ///
    /// # Errors
    /// * [`Error::NoRuntime`] outside a tokio runtime
    /// * [`Error::AlreadyStarted`] on a second call; refillers are left untouched
    /// * [`Error::Refill`] with one entry per refiller that failed to start
    pub fn start(&self, cancel: CancellationToken) -> Result<(), Error> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let receiver = self.receiver.lock().take().ok_or(Error::AlreadyStarted)?;

        let aggregator = runtime.spawn(aggregate_refills(
            Arc::clone(&self.inner),
            receiver,
            cancel.clone(),
        ));
        *self.aggregator.lock() = Some(aggregator);

        let mut errors = MultiError::default();
        for refiller in &self.refillers {
            if let Err(err) = refiller.start_refiller(cancel.clone(), self.queue.clone()) {
                warn!(error = %err, "failed to start refiller");
                errors.push(err);
            }
        }
        debug!(
            capacity = self.inner.capacity,
            refillers = self.refillers.len(),
            "bucket started"
        );

        Ok(errors.into_result()?)
    }

    /// Whether the refill aggregator is running.
    ///
    /// `false` before [`start`](Self::start) and once the start token was cancelled
    /// and the aggregator has wound down.
    pub fn is_running(&self) -> bool {
        self.aggregator
            .lock()
            .as_ref()
            .map_or(false, |aggregator| !aggregator.is_finished())
    }

    /// Stops every refiller, collecting failures like [`start`](Self::start).
    ///
    /// The aggregator keeps running until the token given to `start` is
    /// cancelled, so quantities already queued are still applied.
    pub fn stop(&self) -> Result<(), Error> {
        let mut errors = MultiError::default();
        for refiller in &self.refillers {
            if let Err(err) = refiller.stop_refiller() {
                warn!(error = %err, "failed to stop refiller");
                errors.push(err);
            }
        }
        Ok(errors.into_result()?)
    }
}

/// Applies queued refills until `cancel` fires.
///
/// A failed refill is logged and skipped; it never ends the loop.
async fn aggregate_refills(
    inner: Arc<BucketInner>,
    mut queue: mpsc::Receiver<i64>,
    cancel: CancellationToken,
) {
    loop {
        let tokens = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            tokens = queue.recv() => match tokens {
                Some(tokens) => tokens,
                None => break,
            },
        };

        match inner.add_tokens(tokens) {
            Ok(()) => debug!(tokens, "refill applied"),
            Err(err) => warn!(tokens, error = %err, "failed to apply refill"),
        }
    }
    debug!("refill aggregator stopped");
}

/// Assembles a [`Bucket`].
///
/// Anything not set falls back to the [`Bucket::new`] defaults.
pub struct BucketBuilder {
    capacity: i64,
    queue_capacity: usize,
    ledger: Option<Box<dyn TokenLedger>>,
    consume_strategy: Option<Box<dyn ConsumeStrategy>>,
    refillers: Vec<Arc<dyn Refiller>>,
}

impl BucketBuilder {
    pub fn new(capacity: i64) -> Self {
        BucketBuilder {
            capacity,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ledger: None,
            consume_strategy: None,
            refillers: Vec::new(),
        }
    }

    /// Stores the balance in `ledger` instead of a full in-memory ledger.
    pub fn with_ledger<L>(mut self, ledger: L) -> Self
    where
        L: TokenLedger + 'static,
    {
        self.ledger = Some(Box::new(ledger));
        self
    }

    pub fn with_consume_strategy<S>(mut self, strategy: S) -> Self
    where
        S: ConsumeStrategy + 'static,
    {
        self.consume_strategy = Some(Box::new(strategy));
        self
    }

    /// Adds a refiller. Refillers are started and stopped in insertion order.
    pub fn with_refiller<R>(mut self, refiller: R) -> Self
    where
        R: Refiller + 'static,
    {
        self.refillers.push(Arc::new(refiller));
        self
    }

    /// Number of refill quantities buffered before refillers have to wait.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// # Errors
    /// * [`ConfigError::NegativeCapacity`] if the capacity is below zero
    /// * [`ConfigError::ZeroQueueCapacity`] if the queue capacity is zero
    pub fn build(self) -> Result<Bucket, ConfigError> {
        if self.capacity < 0 {
            return Err(ConfigError::NegativeCapacity {
                capacity: self.capacity,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        let capacity = self.capacity;
        let ledger = self
            .ledger
            .unwrap_or_else(|| Box::new(InMemoryTokenLedger::new(capacity)));
        let consume_strategy = self
            .consume_strategy
            .unwrap_or_else(|| Box::new(StaticConsume::default()));
        let (queue, receiver) = mpsc::channel(self.queue_capacity);

        Ok(Bucket {
            inner: Arc::new(BucketInner {
                capacity,
                ledger: RwLock::new(ledger),
                consume_strategy,
            }),
            refillers: self.refillers,
            queue,
            receiver: Mutex::new(Some(receiver)),
            aggregator: Mutex::new(None),
        })
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Configuration structure for creating a [`Bucket`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BucketConfig {
    /// Maximum number of tokens the bucket can hold.
    pub capacity: i64,
    /// Pending refill quantities buffered before refillers wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl BucketConfig {
    pub fn new(capacity: i64) -> Self {
        BucketConfig {
            capacity,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl From<BucketConfig> for BucketBuilder {
    /// Converts a `BucketConfig` into a builder; values are validated by
    /// [`BucketBuilder::build`].
    ///
    /// # Example
    ///
    /// ```
    /// use rate_guard_bucket::bucket::{BucketBuilder, BucketConfig};
    ///
    /// let config: BucketConfig = serde_json::from_str(r#"{"capacity": 100}"#).unwrap();
    /// let bucket = BucketBuilder::from(config).build().unwrap();
    /// assert_eq!(bucket.available_tokens().unwrap(), 100);
    /// ```
    fn from(config: BucketConfig) -> Self {
        BucketBuilder::new(config.capacity).with_queue_capacity(config.queue_capacity)
    }
}
