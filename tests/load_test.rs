//! Load testing for the balancer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

mod common;
use common::TestBalancer;

#[tokio::test]
async fn test_load_distribution() {
    let backends = [
        common::start_mock_backend("b1").await,
        common::start_mock_backend("b2").await,
        common::start_mock_backend("b3").await,
    ];
    let lb = TestBalancer::start(common::config(&backends)).await;

    let concurrency = 20;
    let requests_per_task = 25;
    let total_requests = concurrency * requests_per_task;

    let client = common::client();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let client = client.clone();
        let url = lb.url("/");
        tasks.push(tokio::spawn(async move {
            let mut results = Vec::new();
            for _ in 0..requests_per_task {
                let req_start = Instant::now();
                if let Ok(res) = client.get(&url).send().await {
                    if res.status().is_success() {
                        if let Ok(body) = res.text().await {
                            results.push((body, req_start.elapsed()));
                        }
                    }
                }
            }
            results
        }));
    }

    let mut per_backend: HashMap<String, usize> = HashMap::new();
    let mut latencies: Vec<Duration> = Vec::new();
    for task in tasks {
        for (body, latency) in task.await.unwrap() {
            *per_backend.entry(body).or_default() += 1;
            latencies.push(latency);
        }
    }

    let duration = start.elapsed();
    assert_eq!(latencies.len(), total_requests, "every request should succeed");
    assert_eq!(per_backend.len(), 3, "every backend should serve traffic");

    // Guards are released when the server drops each response body.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(lb
        .balancer
        .backends()
        .iter()
        .all(|b| b.active_connections() == 0));

    latencies.sort();
    let p50 = latencies[latencies.len() / 2];
    let p99 = latencies[(latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {total_requests}");
    println!("Concurrency:    {concurrency}");
    println!("Total Duration: {duration:?}");
    println!(
        "Requests/sec:   {:.2}",
        total_requests as f64 / duration.as_secs_f64()
    );
    println!("P50 Latency:    {p50:?}");
    println!("P99 Latency:    {p99:?}");
    println!("Distribution:   {per_backend:?}");
    println!("-------------------------\n");

    lb.stop().await;
}
