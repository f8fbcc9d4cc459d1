//! Integration test against a live Redis instance.
//!
//! Exercises the Redis broker end to end: enqueue, claim, progress,
//! completion, retry scheduling and terminal failure. Requires a dedicated
//! Redis reachable via REDIS_URL (defaults to redis://127.0.0.1:6379).
//!
//! Run with: cargo test --test integration_test -- --ignored --test-threads=1

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use species_id::models::job::JobState;
use species_id::queue::codec::JobPayload;
use species_id::queue::{Broker, Producer, RedisBroker, StatusReader};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn payload() -> JobPayload {
    JobPayload {
        image_bytes: b"fake image data for testing".to_vec(),
        mime_type: "image/png".to_string(),
        original_file_name: "test.png".to_string(),
        user_id: Some("test-user".to_string()),
    }
}

#[tokio::test]
#[ignore]
async fn redis_broker_full_lifecycle() {
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(&redis_url())
            .expect("Failed to initialize broker")
            .with_claims_per_second(1_000),
    );
    broker.health_check().await.expect("Redis not reachable");

    let producer = Producer::new(broker.clone());
    let reader = StatusReader::new(broker.clone());

    // Enqueue
    let id = producer.enqueue(&payload()).await.expect("Failed to enqueue");
    let status = reader.get_status(&id).await.unwrap().expect("Job not found");
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.attempts, 0);

    // Progress reports are ignored unless the job is active
    broker.update_progress(&id, 50).await.unwrap();
    let status = reader.get_status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.progress, 0);

    // Claim until our job comes up (the queue may hold leftovers from
    // earlier runs).
    let claimed = loop {
        let env = broker
            .claim()
            .await
            .expect("Claim failed")
            .expect("Queue drained without yielding the test job");
        if env.id == id {
            break env;
        }
    };
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.started_at.is_some());

    // Progress is visible to pollers while active
    broker.update_progress(&id, 30).await.unwrap();
    let status = reader.get_status(&id).await.unwrap().unwrap();
    assert_eq!(status.progress, 30);

    // Retry scheduling: delayed, then claimable again after the backoff
    broker.retry(&id, Duration::from_millis(100)).await.unwrap();
    let status = reader.get_status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Delayed);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let reclaimed = loop {
        let env = broker
            .claim()
            .await
            .expect("Claim failed")
            .expect("Delayed job was not promoted");
        if env.id == id {
            break env;
        }
    };
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.progress, 0);

    // Completion
    let result = serde_json::json!({ "label": "Grey Heron", "confidence": 0.9 });
    broker.complete(&id, result.clone()).await.unwrap();
    let status = reader.get_status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.result, Some(result));
    assert!(status.failure_reason.is_none());
    assert!(status.finished_at.is_some());

    // Terminal failure path on a second job
    let id2 = producer.enqueue(&payload()).await.unwrap();
    let claimed2 = loop {
        let env = broker.claim().await.unwrap().expect("Second job not claimable");
        if env.id == id2 {
            break env;
        }
    };
    assert_eq!(claimed2.attempts, 1);
    broker.fail(&id2, "provider rejected input").await.unwrap();
    let status2 = reader.get_status(&id2).await.unwrap().unwrap();
    assert_eq!(status2.state, JobState::Failed);
    assert_eq!(
        status2.failure_reason.as_deref(),
        Some("provider rejected input")
    );
    assert!(status2.result.is_none());

    // Sweep runs clean on a healthy queue
    broker.sweep().await.expect("Sweep failed");

    println!("Redis broker lifecycle test passed");
}

#[tokio::test]
#[ignore]
async fn sweep_recovers_claim_lost_mid_hand_off() {
    let broker: Arc<dyn Broker> =
        Arc::new(RedisBroker::new(&redis_url()).expect("Failed to initialize broker"));
    broker.health_check().await.expect("Redis not reachable");
    let producer = Producer::new(broker.clone());

    let id = producer.enqueue(&payload()).await.expect("Failed to enqueue");

    // A claimer that dies right after the pop leaves the id parked in the
    // claiming list with no active deadline.
    let client = redis::Client::open(redis_url().as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    loop {
        let moved: Option<String> = redis::cmd("RPOPLPUSH")
            .arg("species_id:waiting")
            .arg("species_id:claiming")
            .query_async(&mut conn)
            .await
            .unwrap();
        match moved {
            Some(ref m) if *m == id => break,
            // Leftovers from earlier runs; the sweeps below requeue them too.
            Some(_) => continue,
            None => panic!("enqueued id not found in waiting list"),
        }
    }

    // First sweep marks the orphan, second requeues it.
    broker.sweep().await.unwrap();
    let stats = broker.sweep().await.unwrap();
    assert!(stats.requeued >= 1);

    let env = broker.fetch(&id).await.unwrap().expect("envelope lost");
    assert_eq!(env.state, JobState::Waiting);

    let parked: Vec<String> = conn.lrange("species_id:claiming", 0, -1).await.unwrap();
    assert!(!parked.contains(&id));
    let waiting: Vec<String> = conn.lrange("species_id:waiting", 0, -1).await.unwrap();
    assert!(waiting.contains(&id));
}

#[tokio::test]
#[ignore]
async fn progress_report_after_requeue_is_dropped() {
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(&redis_url())
            .expect("Failed to initialize broker")
            .with_claims_per_second(1_000)
            .with_visibility(Duration::from_millis(50)),
    );
    broker.health_check().await.expect("Redis not reachable");
    let producer = Producer::new(broker.clone());

    let id = producer.enqueue(&payload()).await.expect("Failed to enqueue");
    loop {
        let env = broker.claim().await.unwrap().expect("job not claimable");
        if env.id == id {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = broker.sweep().await.unwrap();
    assert!(stats.requeued >= 1);

    // A slow worker reporting progress for its lost claim must not flip the
    // requeued envelope back to active.
    broker.update_progress(&id, 85).await.unwrap();
    let env = broker.fetch(&id).await.unwrap().expect("envelope lost");
    assert_eq!(env.state, JobState::Waiting);
    assert_eq!(env.progress, 0);
}
