use std::sync::Arc;
use std::time::Duration;

use rate_guard_bucket::{
    Bucket, ConfigError, InMemoryTokenLedger, ManualRefiller, RefillError, Refiller,
    TimeRefiller, TimeRefillerConfig,
};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_millis(500);

/// A bit more than one interval, so the first tick has fired.
fn one_interval() -> Duration {
    INTERVAL + Duration::from_millis(50)
}

fn drain(tokens: &mut mpsc::Receiver<i64>) -> Vec<i64> {
    let mut received = Vec::new();
    while let Ok(quantity) = tokens.try_recv() {
        received.push(quantity);
    }
    received
}

#[test]
fn test_time_refiller_rejects_invalid_config() {
    assert!(matches!(
        TimeRefiller::new(-1, INTERVAL),
        Err(ConfigError::NegativeRefillRate { rate: -1 })
    ));
    assert!(matches!(
        TimeRefiller::new(10, Duration::ZERO),
        Err(ConfigError::ZeroRefillInterval)
    ));
}

#[test]
fn test_time_refiller_from_config() {
    let config: TimeRefillerConfig =
        serde_json::from_str(r#"{"refill_rate": 10, "interval": {"secs": 0, "nanos": 500000000}}"#)
            .unwrap();
    let refiller = TimeRefiller::try_from(config).unwrap();
    assert_eq!(refiller.refill_rate(), 10);
    assert_eq!(refiller.interval(), INTERVAL);
}

#[test]
fn test_time_refiller_needs_runtime() {
    let (queue, _tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();
    assert_eq!(
        refiller.start_refiller(CancellationToken::new(), queue),
        Err(RefillError::NoRuntime)
    );
    // Still idle, a later start inside a runtime is possible
    assert!(!refiller.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_sends_after_one_interval() {
    let (queue, mut tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    time::sleep(one_interval()).await;
    refiller.stop_refiller().unwrap();

    assert_eq!(drain(&mut tokens), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_nothing_before_first_interval() {
    let (queue, mut tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    time::sleep(INTERVAL - Duration::from_millis(50)).await;

    assert!(drain(&mut tokens).is_empty());
    refiller.stop_refiller().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_silent_after_stop() {
    let (queue, mut tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    time::sleep(one_interval()).await;
    refiller.stop_refiller().unwrap();
    assert!(!refiller.is_running());

    // Two more intervals, nothing new should arrive
    time::sleep(INTERVAL * 2).await;

    assert_eq!(drain(&mut tokens), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_silent_after_cancel() {
    let (queue, mut tokens) = mpsc::channel(10);
    let cancel = CancellationToken::new();
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(cancel.clone(), queue).unwrap();
    time::sleep(one_interval()).await;

    // Cancel the shared token without calling stop
    cancel.cancel();
    assert!(!refiller.is_running());
    time::sleep(INTERVAL * 2).await;

    assert_eq!(drain(&mut tokens), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_keeps_ticking() {
    let (queue, mut tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    time::sleep(INTERVAL * 3 + Duration::from_millis(50)).await;
    refiller.stop_refiller().unwrap();

    assert_eq!(drain(&mut tokens), vec![10, 10, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_time_refiller_total_on_real_clock() {
    let step = Duration::from_millis(10);
    let (queue, mut tokens) = mpsc::channel(512);
    let refiller = TimeRefiller::new(1, step).unwrap();

    let started = std::time::Instant::now();
    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    time::sleep(step * 100 + Duration::from_millis(5)).await;
    refiller.stop_refiller().unwrap();
    let upper = started.elapsed().as_millis() / step.as_millis();
    time::sleep(step * 2).await;

    // Late wakeups must not lose the partial intervals in between
    let total: i64 = drain(&mut tokens).iter().sum();
    assert!(total >= 90, "total={}", total);
    assert!(total as u128 <= upper, "total={} upper={}", total, upper);
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_zero_rate_sends_nothing() {
    let (queue, mut tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(0, INTERVAL).unwrap();

    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    time::sleep(INTERVAL * 3).await;
    refiller.stop_refiller().unwrap();

    assert!(drain(&mut tokens).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_time_refiller_waits_on_full_queue() {
    let (queue, mut tokens) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(cancel.clone(), queue).unwrap();
    // Three ticks, but only one slot
    time::sleep(INTERVAL * 3 + Duration::from_millis(50)).await;
    assert_eq!(tokens.try_recv().unwrap(), 10);

    // The blocked push lands as soon as a slot frees up
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(tokens.try_recv().unwrap(), 10);

    // Cancelling releases a producer parked on a full queue
    time::sleep(INTERVAL * 2).await;
    cancel.cancel();
    drop(refiller);
    let drained = time::timeout(Duration::from_secs(5), async {
        let mut count = 0;
        while tokens.recv().await.is_some() {
            count += 1;
        }
        count
    })
    .await
    .expect("refiller task should exit after cancellation");
    assert!(drained <= 1);
}

#[tokio::test]
async fn test_time_refiller_lifecycle() {
    let (queue, _tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.start_refiller(CancellationToken::new(), queue.clone()).unwrap();
    assert!(refiller.is_running());
    assert_eq!(
        refiller.start_refiller(CancellationToken::new(), queue.clone()),
        Err(RefillError::AlreadyStarted)
    );

    refiller.stop_refiller().unwrap();
    refiller.stop_refiller().unwrap();

    // A stopped refiller is not restarted
    assert_eq!(
        refiller.start_refiller(CancellationToken::new(), queue),
        Err(RefillError::AlreadyStarted)
    );
}

#[tokio::test]
async fn test_stop_before_start_is_harmless() {
    let (queue, _tokens) = mpsc::channel(10);
    let refiller = TimeRefiller::new(10, INTERVAL).unwrap();

    refiller.stop_refiller().unwrap();
    refiller.stop_refiller().unwrap();
    assert!(!refiller.is_running());
    assert_eq!(
        refiller.start_refiller(CancellationToken::new(), queue),
        Err(RefillError::AlreadyStarted)
    );
}

#[tokio::test]
async fn test_manual_refiller_pushes_on_demand() {
    let (queue, mut tokens) = mpsc::channel(10);
    let refiller = ManualRefiller::new();

    assert_eq!(refiller.refill(1).await, Err(RefillError::NotRunning));

    refiller.start_refiller(CancellationToken::new(), queue).unwrap();
    refiller.refill(3).await.unwrap();
    refiller.try_refill(4).unwrap();
    assert_eq!(drain(&mut tokens), vec![3, 4]);

    assert_eq!(
        refiller.refill(-1).await,
        Err(RefillError::NegativeQuantity { quantity: -1 })
    );
    assert_eq!(
        refiller.try_refill(-2),
        Err(RefillError::NegativeQuantity { quantity: -2 })
    );
}

#[tokio::test]
async fn test_manual_refiller_full_queue() {
    let (queue, mut tokens) = mpsc::channel(1);
    let refiller = Arc::new(ManualRefiller::new());
    refiller.start_refiller(CancellationToken::new(), queue).unwrap();

    refiller.try_refill(1).unwrap();
    assert_eq!(refiller.try_refill(2), Err(RefillError::QueueFull));

    // A blocked refill gives up once the refiller is stopped
    let blocked = tokio::spawn({
        let refiller = Arc::clone(&refiller);
        async move { refiller.refill(2).await }
    });
    tokio::task::yield_now().await;
    refiller.stop_refiller().unwrap();

    assert_eq!(blocked.await.unwrap(), Err(RefillError::NotRunning));
    assert_eq!(drain(&mut tokens), vec![1]);
}

#[tokio::test]
async fn test_manual_refiller_closed_queue() {
    let (queue, tokens) = mpsc::channel(1);
    let refiller = ManualRefiller::new();
    refiller.start_refiller(CancellationToken::new(), queue).unwrap();

    drop(tokens);
    assert_eq!(refiller.refill(1).await, Err(RefillError::QueueClosed));
    assert_eq!(refiller.try_refill(1), Err(RefillError::QueueClosed));
}

#[tokio::test(start_paused = true)]
async fn test_bucket_refilled_over_time() {
    let bucket = Bucket::builder(25)
        .with_ledger(InMemoryTokenLedger::new(0))
        .with_refiller(TimeRefiller::new(10, INTERVAL).unwrap())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    bucket.start(cancel.clone()).unwrap();

    time::sleep(INTERVAL * 2 + Duration::from_millis(50)).await;
    assert_eq!(bucket.available_tokens().unwrap(), 20);

    // Refills beyond capacity are discarded
    time::sleep(INTERVAL * 2).await;
    assert_eq!(bucket.available_tokens().unwrap(), 25);

    cancel.cancel();
    bucket.stop().unwrap();
}
