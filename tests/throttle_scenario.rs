mod common;

use common::test_helpers::{counting_fetch, ApiError, Reply};
use fetchgate::{FetchSource, RequestOrchestrator};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn orchestrator(concurrent: usize, per_window: usize, window: Duration) -> RequestOrchestrator<Reply, ApiError> {
    RequestOrchestrator::builder()
        .max_concurrent_requests(concurrent)
        .max_requests_in_timeframe(per_window)
        .sliding_timeframe(window)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn five_calls_against_two_concurrent_three_per_second() {
    let orch = orchestrator(2, 3, Duration::from_secs(1));
    let t0 = Instant::now();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let calls = (0..5).map(|i| {
        let starts = Arc::clone(&starts);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        orch.fetch(format!("activities?id={i}"), move || async move {
            starts.lock().unwrap().push(t0.elapsed());
            let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, ApiError>(Reply::new(i.to_string()))
        })
    });
    let results = join_all(calls).await;
    assert!(results.iter().all(|r| r.as_ref().ok().map(|f| f.source) == Some(FetchSource::Fetched)));

    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    let ms: Vec<u128> = starts.iter().map(|d| d.as_millis()).collect();

    assert!(ms[0] < 10 && ms[1] < 10, "first two start immediately: {ms:?}");
    assert!((100..200).contains(&ms[2]), "third waits for a free slot: {ms:?}");
    assert!(ms[3] >= 1000 && ms[4] >= 1000, "last two wait for the window: {ms:?}");
    assert!(ms[4] < 1100, "no extra delay past the window: {ms:?}");
    assert!(peak.load(Ordering::SeqCst) <= 2);

    for (i, at) in starts.iter().enumerate() {
        let in_window = starts[..=i].iter().filter(|s| *at - **s < Duration::from_secs(1)).count();
        assert!(in_window <= 3, "{in_window} calls within one second ending at {at:?}");
    }

    let stats = orch.gate().stats();
    assert_eq!(stats.issued, 5);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn cache_hits_bypass_an_exhausted_window() {
    let orch = orchestrator(4, 1, Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    orch.fetch("athlete?id=1", counting_fetch(&calls, Duration::ZERO, Ok(Reply::new("a"))))
        .await
        .unwrap();

    let started = Instant::now();
    for _ in 0..10 {
        let hit = orch
            .fetch("athlete?id=1", counting_fetch(&calls, Duration::ZERO, Ok(Reply::new("b"))))
            .await
            .unwrap();
        assert!(hit.is_cache_hit());
    }
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(orch.gate().stats().issued, 1);

    // A different endpoint has to wait out the window.
    let other = orch
        .fetch("athlete?id=2", counting_fetch(&calls, Duration::ZERO, Ok(Reply::new("c"))))
        .await
        .unwrap();
    assert_eq!(other.source, FetchSource::Fetched);
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn server_backoff_delays_every_method() {
    let orch = orchestrator(4, 100, Duration::from_secs(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let throttled = Reply { body: "rate limited".into(), retry_after: Some(Duration::from_secs(30)) };

    orch.fetch("segments.get?id=1", counting_fetch(&calls, Duration::ZERO, Ok(throttled)))
        .await
        .unwrap();

    let started = Instant::now();
    orch.fetch("athlete.stats?id=1", counting_fetch(&calls, Duration::ZERO, Ok(Reply::new("s"))))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(orch.gate().stats().backoff_remaining, None);
}
