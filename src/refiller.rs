//! Background sources of refill tokens.
//!
//! A [`Refiller`] is started once by its [`Bucket`](crate::bucket::Bucket) and
//! pushes refill quantities into the bucket's bounded queue. Pushes wait for a
//! free slot when the queue is full, so a slow bucket throttles its refillers
//! instead of losing refills.
//!
//! Lifecycle: `idle -> running -> stopped`. A refiller stops when its own
//! [`stop_refiller`](Refiller::stop_refiller) is called or when the token
//! handed to [`start_refiller`](Refiller::start_refiller) is cancelled,
//! whichever comes first. A stopped refiller cannot be started again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConfigError, RefillError};

/// A producer of refill quantities.
pub trait Refiller: Send + Sync {
    /// Starts producing into `queue` until `cancel` fires or the refiller is stopped.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// * [`RefillError::AlreadyStarted`] if the refiller left the idle state
    /// * [`RefillError::NoRuntime`] outside a tokio runtime
    fn start_refiller(
        &self,
        cancel: CancellationToken,
        queue: mpsc::Sender<i64>,
    ) -> Result<(), RefillError>;

    /// Stops producing. Calling it before start or more than once is a no-op.
    fn stop_refiller(&self) -> Result<(), RefillError>;
}

impl<R> Refiller for Arc<R>
where
    R: Refiller + ?Sized,
{
    fn start_refiller(
        &self,
        cancel: CancellationToken,
        queue: mpsc::Sender<i64>,
    ) -> Result<(), RefillError> {
        (**self).start_refiller(cancel, queue)
    }

    fn stop_refiller(&self) -> Result<(), RefillError> {
        (**self).stop_refiller()
    }
}

enum RefillerState {
    Idle,
    Running {
        cancel: CancellationToken,
        queue: mpsc::Sender<i64>,
    },
    Stopped,
}

/// State machine shared by the refillers of this module.
struct Lifecycle {
    state: Mutex<RefillerState>,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            state: Mutex::new(RefillerState::Idle),
        }
    }

    /// Moves to running and returns the refiller's own token, a child of `parent`.
    fn start(
        &self,
        parent: &CancellationToken,
        queue: &mpsc::Sender<i64>,
    ) -> Result<CancellationToken, RefillError> {
        let mut state = self.state.lock();
        if !matches!(*state, RefillerState::Idle) {
            return Err(RefillError::AlreadyStarted);
        }
        let cancel = parent.child_token();
        *state = RefillerState::Running {
            cancel: cancel.clone(),
            queue: queue.clone(),
        };
        Ok(cancel)
    }

    /// Returns `true` if the refiller was running.
    fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), RefillerState::Stopped);
        match previous {
            RefillerState::Running { cancel, .. } => {
                cancel.cancel();
                true
            }
            RefillerState::Idle | RefillerState::Stopped => false,
        }
    }

    fn running(&self) -> Option<(CancellationToken, mpsc::Sender<i64>)> {
        match &*self.state.lock() {
            RefillerState::Running { cancel, queue } if !cancel.is_cancelled() => {
                Some((cancel.clone(), queue.clone()))
            }
            _ => None,
        }
    }

    fn is_running(&self) -> bool {
        self.running().is_some()
    }
}

fn ensure_runtime() -> Result<tokio::runtime::Handle, RefillError> {
    tokio::runtime::Handle::try_current().map_err(|_| RefillError::NoRuntime)
}

/// Adds `refill_rate` tokens for every elapsed `interval`.
///
/// The first refill happens one interval after start. On each tick the number
/// of whole intervals elapsed since the previous refill is multiplied by the
/// rate and pushed; ticks yielding zero tokens push nothing.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use rate_guard_bucket::refiller::TimeRefiller;
///
/// // 10 tokens every 500ms
/// let refiller = TimeRefiller::new(10, Duration::from_millis(500)).unwrap();
/// assert_eq!(refiller.refill_rate(), 10);
/// ```
pub struct TimeRefiller {
    refill_rate: i64,
    interval: Duration,
    lifecycle: Lifecycle,
}

impl TimeRefiller {
    /// Creates a refiller adding `refill_rate` tokens every `interval`.
    ///
    /// # Errors
    /// * [`ConfigError::NegativeRefillRate`] if `refill_rate < 0`
    /// * [`ConfigError::ZeroRefillInterval`] if `interval` is zero
    pub fn new(refill_rate: i64, interval: Duration) -> Result<Self, ConfigError> {
        if refill_rate < 0 {
            return Err(ConfigError::NegativeRefillRate { rate: refill_rate });
        }
        if interval.is_zero() {
            return Err(ConfigError::ZeroRefillInterval);
        }
        Ok(TimeRefiller {
            refill_rate,
            interval,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn refill_rate(&self) -> i64 {
        self.refill_rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the background task is (still) supposed to be producing.
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

impl Refiller for TimeRefiller {
    fn start_refiller(
        &self,
        cancel: CancellationToken,
        queue: mpsc::Sender<i64>,
    ) -> Result<(), RefillError> {
        let runtime = ensure_runtime()?;
        let cancel = self.lifecycle.start(&cancel, &queue)?;
        let last_refill = Instant::now();

        runtime.spawn(run_time_refiller(
            cancel,
            queue,
            self.refill_rate,
            self.interval,
            last_refill,
        ));
        debug!(
            refill_rate = self.refill_rate,
            interval = ?self.interval,
            "time refiller started"
        );
        Ok(())
    }

    fn stop_refiller(&self) -> Result<(), RefillError> {
        if self.lifecycle.stop() {
            debug!("time refiller stopped");
        }
        Ok(())
    }
}

async fn run_time_refiller(
    cancel: CancellationToken,
    queue: mpsc::Sender<i64>,
    refill_rate: i64,
    interval: Duration,
    mut last_refill: Instant,
) {
    let mut ticker = time::interval_at(last_refill + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_refill).as_nanos();
        let elapsed_ticks = elapsed / interval.as_nanos();
        // Keep the partial interval for the next tick.
        last_refill = now - partial_interval(elapsed % interval.as_nanos());

        let quantity = i64::try_from(elapsed_ticks)
            .unwrap_or(i64::MAX)
            .saturating_mul(refill_rate);
        if quantity == 0 {
            continue;
        }

        // A full queue parks us here; cancellation must still get through.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = queue.send(quantity) => {
                if sent.is_err() {
                    debug!("refill queue closed");
                    break;
                }
            }
        }
    }
}

/// `nanos` is below one refill interval, so the seconds always fit.
fn partial_interval(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    Duration::new(
        (nanos / NANOS_PER_SEC) as u64,
        (nanos % NANOS_PER_SEC) as u32,
    )
}

/// Refills on demand.
///
/// The caller decides when and how much to refill; quantities go through the
/// same queue as every other refiller of the bucket.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use rate_guard_bucket::bucket::Bucket;
/// use rate_guard_bucket::ledger::InMemoryTokenLedger;
/// use rate_guard_bucket::refiller::ManualRefiller;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let refiller = Arc::new(ManualRefiller::new());
/// let bucket = Bucket::builder(10)
///     .with_ledger(InMemoryTokenLedger::new(0))
///     .with_refiller(refiller.clone())
///     .build()
///     .unwrap();
///
/// let cancel = CancellationToken::new();
/// bucket.start(cancel.clone()).unwrap();
/// refiller.refill(4).await.unwrap();
/// cancel.cancel();
/// # }
/// ```
pub struct ManualRefiller {
    lifecycle: Lifecycle,
}

impl ManualRefiller {
    pub fn new() -> Self {
        ManualRefiller {
            lifecycle: Lifecycle::new(),
        }
    }

    /// Pushes `tokens`, waiting for a free queue slot.
    ///
    /// # Errors
    /// * [`RefillError::NegativeQuantity`] if `tokens < 0`
    /// * [`RefillError::NotRunning`] if not running, or stopped while waiting
    /// * [`RefillError::QueueClosed`] if the bucket is gone
    pub async fn refill(&self, tokens: i64) -> Result<(), RefillError> {
        if tokens < 0 {
            return Err(RefillError::NegativeQuantity { quantity: tokens });
        }
        let (cancel, queue) = self.lifecycle.running().ok_or(RefillError::NotRunning)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RefillError::NotRunning),
            sent = queue.send(tokens) => sent.map_err(|_| RefillError::QueueClosed),
        }
    }

    /// Pushes `tokens` without waiting.
    ///
    /// # Errors
    /// Same as [`refill`](Self::refill), plus [`RefillError::QueueFull`] when no slot is free.
    pub fn try_refill(&self, tokens: i64) -> Result<(), RefillError> {
        if tokens < 0 {
            return Err(RefillError::NegativeQuantity { quantity: tokens });
        }
        let (_, queue) = self.lifecycle.running().ok_or(RefillError::NotRunning)?;

        queue.try_send(tokens).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RefillError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RefillError::QueueClosed,
        })
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

impl Default for ManualRefiller {
    fn default() -> Self {
        Self::new()
    }
}

impl Refiller for ManualRefiller {
    fn start_refiller(
        &self,
        cancel: CancellationToken,
        queue: mpsc::Sender<i64>,
    ) -> Result<(), RefillError> {
        self.lifecycle.start(&cancel, &queue)?;
        debug!("manual refiller started");
        Ok(())
    }

    fn stop_refiller(&self) -> Result<(), RefillError> {
        if self.lifecycle.stop() {
            debug!("manual refiller stopped");
        }
        Ok(())
    }
}

/// Configuration structure for creating a [`TimeRefiller`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimeRefillerConfig {
    /// Tokens added per interval.
    pub refill_rate: i64,
    /// Time between refills.
    pub interval: Duration,
}

impl TryFrom<TimeRefillerConfig> for TimeRefiller {
    type Error = ConfigError;

    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use rate_guard_bucket::refiller::{TimeRefiller, TimeRefillerConfig};
    ///
    /// let refiller: TimeRefiller = TimeRefillerConfig {
    ///     refill_rate: 5,
    ///     interval: Duration::from_secs(1),
    /// }
    /// .try_into()
    /// .unwrap();
    /// ```
    fn try_from(config: TimeRefillerConfig) -> Result<Self, Self::Error> {
        TimeRefiller::new(config.refill_rate, config.interval)
    }
}
