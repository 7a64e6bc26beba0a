//! Session affinity routing, expiry and cleanup

mod common;

use common::*;
use serde_json::json;
use snakepit_pool::{CheckinOutcome, ExecuteOptions, Pool};
use std::time::Duration;

async fn hit(pool: &Pool, session: &str) -> (String, u64) {
    let reply = pool
        .execute_in_session(
            Some(session),
            "session_hit",
            json!({"session_id": session}),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    (worker_of(&reply), reply["hits"].as_u64().unwrap())
}

#[tokio::test]
async fn test_session_returns_to_its_worker() {
    let pool = start(echo_config(3)).await;

    let (first, hits) = hit(&pool, "s1").await;
    assert_eq!(hits, 1);
    for expected in 2..=4 {
        let (worker, hits) = hit(&pool, "s1").await;
        assert_eq!(worker, first);
        assert_eq!(hits, expected);
    }

    let stats = pool.stats();
    assert_eq!(stats.session_count, 1);
    let bound = stats
        .workers
        .iter()
        .find(|w| w.id.as_str() == first)
        .unwrap();
    assert_eq!(bound.bound_session.as_deref(), Some("s1"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_busy_affinity_worker_falls_back() {
    let pool = start(echo_config(2)).await;
    let (first, _) = hit(&pool, "s1").await;

    // Occupy the bound worker, then ask again for the same session
    let held = pool.checkout(Some("s1"), None).await.unwrap();
    assert_eq!(held.worker_id().as_str(), first);

    let (other, hits) = hit(&pool, "s1").await;
    assert_ne!(other, first);
    assert_eq!(hits, 1);

    pool.checkin(held, CheckinOutcome::Healthy);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_affinity_expires_after_ttl() {
    let mut config = echo_config(2);
    config.affinity.ttl = Duration::from_millis(200);
    config.affinity.sweep_interval = Duration::from_millis(50);
    let pool = start(config).await;

    let (first, _) = hit(&pool, "s1").await;
    for _ in 0..5 {
        assert_eq!(hit(&pool, "s1").await.0, first);
    }
    assert_eq!(pool.stats().session_count, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(wait_until(Duration::from_secs(1), || pool.stats().session_count == 0).await);
    assert!(wait_until(Duration::from_secs(1), || ready_ids(&pool).len() == 2).await);

    // Routed like a new session: the longest-idle worker, not the old one
    let (second, hits) = hit(&pool, "s1").await;
    assert_ne!(second, first);
    assert_eq!(hits, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_end_session_cleans_worker_state() {
    let pool = start(echo_config(1)).await;

    assert_eq!(hit(&pool, "s1").await.1, 1);
    assert_eq!(hit(&pool, "s1").await.1, 2);

    assert!(pool.end_session("s1"));
    assert!(!pool.end_session("s1"));
    assert!(!pool.end_session("never-seen"));
    assert_eq!(pool.stats().session_count, 0);

    // The cleanup holds the worker first, so this sees fresh state
    assert_eq!(hit(&pool, "s1").await.1, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_affinity_disabled_ignores_sessions() {
    let mut config = echo_config(2);
    config.affinity.enabled = false;
    let pool = start(config).await;

    let (first, _) = hit(&pool, "s1").await;
    let (second, _) = hit(&pool, "s1").await;
    assert_ne!(first, second);
    assert_eq!(pool.stats().session_count, 0);

    pool.shutdown().await;
}
