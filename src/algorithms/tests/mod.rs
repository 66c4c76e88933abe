// src/algorithms/tests/mod.rs

/// Tests for Fixed Window algorithm
mod fixed_window_tests;

/// Tests for Sliding Window algorithm
mod sliding_window_tests;

/// Tests for Token Bucket algorithm
mod token_bucket_tests;

/// Tests for Leaky Bucket algorithm
mod leaky_bucket_tests;

/// Common tests for all algorithms
#[cfg(test)]
mod common_tests {
    use futures::future::join_all;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};
    use tracing_test::traced_test;

    use crate::{
        algorithms::{Decision, RateLimitAlgorithm},
        test_utils::{allowed_counts, hit_times, TestEnv},
    };

    /// Sequential hits under the limit are admitted with counts 1..N, then denied
    #[tokio::test]
    async fn test_window_engines_count_up_to_limit() {
        let env = TestEnv::new();
        let scale = Duration::from_secs(60);

        let fixed = hit_times(&env.fixed_window(), "fw", scale, 4, 6).await;
        let sliding = hit_times(&env.sliding_window(), "sw", scale, 4, 6).await;

        for (name, decisions) in [("fixed_window", fixed), ("sliding_window", sliding)] {
            assert_eq!(allowed_counts(&decisions), vec![1, 2, 3, 4], "{}", name);
            assert!(
                decisions[4..].iter().all(|d| !d.is_allowed()),
                "{} should deny past the limit",
                name
            );
        }
    }

    /// Concurrent hits on one key never share a pre-update state
    #[tokio::test]
    async fn test_concurrent_hits_are_atomic() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(60);

        let hits = (0..50).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.hit("shared", scale, 20, 1).await })
        });
        let decisions: Vec<Decision> = join_all(hits)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let counts: BTreeSet<u64> = decisions.iter().filter_map(Decision::count).collect();
        assert_eq!(counts, (1..=20).collect::<BTreeSet<u64>>());
        assert_eq!(decisions.iter().filter(|d| !d.is_allowed()).count(), 30);
        assert_eq!(limiter.get("shared", scale).await.unwrap(), 50);
    }

    /// Concurrent bucket hits never overdraw the bucket
    #[tokio::test]
    async fn test_concurrent_bucket_hits_respect_capacity() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        let hits = (0..25).map(|_| {
            let bucket = bucket.clone();
            async move { bucket.hit("shared", 1.0, 10, 1).await }
        });
        let results = join_all(hits).await;

        let allowed = results
            .into_iter()
            .map(|result| result.unwrap())
            .filter(Decision::is_allowed)
            .count();
        assert_eq!(allowed, 10);
        assert_eq!(bucket.get("shared", 1.0).await.unwrap(), 0);
    }

    /// A slow store surfaces as a timeout, never as a decision
    #[tokio::test]
    async fn test_timeout_is_distinct_from_deny() {
        let env = TestEnv::new();
        let slow = env.storage.clone().with_latency(Duration::from_millis(200));
        let limiter = crate::algorithms::FixedWindow::new(slow, crate::test_utils::test_config())
            .with_clock(env.clock())
            .with_timeout(Duration::from_millis(20));

        let err = assert_err!(limiter.hit("slow", Duration::from_secs(1), 5, 1).await);
        assert!(err.is_timeout(), "expected a timeout, got {:?}", err);

        // same keyspace, no latency: well inside the deadline
        let fast = env.fixed_window().with_timeout(Duration::from_millis(200));
        assert_ok!(fast.hit("slow", Duration::from_secs(1), 5, 1).await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_decisions_are_logged() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);

        assert_ok!(limiter.hit("logged", scale, 1, 1).await);
        let decision = assert_ok!(limiter.hit("logged", scale, 1, 1).await);
        assert!(!decision.is_allowed());

        assert!(logs_contain("Rate limit check"));
        assert!(logs_contain("allowed=false"));
    }

    /// Keys are namespaced by the prefix
    #[tokio::test]
    async fn test_prefix_isolates_limiters() {
        let env = TestEnv::new();
        let scale = Duration::from_secs(10);
        let a = env.fixed_window().with_prefix("tenant-a");
        let b = env.fixed_window().with_prefix("tenant-b");

        assert_ok!(a.hit("user", scale, 1, 1).await);
        assert!(!a.hit("user", scale, 1, 1).await.unwrap().is_allowed());
        assert_eq!(b.hit("user", scale, 1, 1).await.unwrap(), Decision::Allow { count: 1 });
    }
}
