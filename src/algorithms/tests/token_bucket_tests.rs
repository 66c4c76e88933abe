#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        algorithms::{Decision, RateLimitAlgorithm},
        config::BucketConfig,
        error::RateLimiterError,
        keys::bucket_key,
        storage::StorageBackend,
        test_utils::{allowed_counts, hit_times, TestEnv},
    };

    /// Test token consumption from a fresh, full bucket
    #[tokio::test]
    async fn test_fresh_bucket_starts_full() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        let decisions = hit_times(&bucket, "user", 2.0, 10, 4).await;
        assert_eq!(allowed_counts(&decisions), vec![9, 8, 7, 6]);
        assert_eq!(bucket.get("user", 2.0).await.unwrap(), 6);
    }

    /// Test token depletion
    #[tokio::test]
    async fn test_depleted_bucket_denies_with_fixed_hint() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        let decisions = hit_times(&bucket, "user", 1.0, 3, 4).await;
        assert_eq!(allowed_counts(&decisions), vec![2, 1, 0]);
        assert_eq!(
            decisions[3],
            Decision::Deny {
                retry_after: Duration::from_millis(1_000)
            }
        );

        // a different key has its own bucket
        assert_eq!(
            bucket.hit("other", 1.0, 3, 1).await.unwrap(),
            Decision::Allow { count: 2 }
        );
    }

    /// After paying `cost`, waiting cost/rate seconds refills it
    #[tokio::test]
    async fn test_refill_after_waiting() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        assert_eq!(
            bucket.hit("user", 2.0, 5, 5).await.unwrap(),
            Decision::Allow { count: 0 }
        );
        assert!(!bucket.hit("user", 2.0, 5, 5).await.unwrap().is_allowed());

        // ceil(5 / 2) seconds
        env.advance(Duration::from_secs(3));
        assert_eq!(
            bucket.hit("user", 2.0, 5, 5).await.unwrap(),
            Decision::Allow { count: 0 }
        );
    }

    /// Refill is floored and never exceeds capacity
    #[tokio::test]
    async fn test_refill_is_floored_and_clamped() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        hit_times(&bucket, "user", 0.5, 4, 4).await;
        env.advance(Duration::from_secs(3));
        // 1.5 tokens refilled, floored to 1
        assert_eq!(
            bucket.hit("user", 0.5, 4, 1).await.unwrap(),
            Decision::Allow { count: 0 }
        );

        env.advance(Duration::from_secs(3_600));
        assert_eq!(
            bucket.hit("user", 0.5, 4, 1).await.unwrap(),
            Decision::Allow { count: 3 }
        );
    }

    /// A denied hit does not move `last_update`
    #[tokio::test]
    async fn test_denied_hit_leaves_state_untouched() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        hit_times(&bucket, "user", 1.0, 2, 2).await;
        env.advance(Duration::from_secs(1));
        assert!(!bucket.hit("user", 1.0, 2, 2).await.unwrap().is_allowed());
        env.advance(Duration::from_secs(1));
        assert!(bucket.hit("user", 1.0, 2, 2).await.unwrap().is_allowed());
    }

    /// The bucket lives for its refill time plus the buffer
    #[tokio::test]
    async fn test_bucket_expires_after_refill_time_and_buffer() {
        let env = TestEnv::new();
        let bucket = env.token_bucket().with_bucket_config(BucketConfig {
            ttl_buffer: Duration::from_secs(10),
            deny_retry_after: Duration::from_millis(250),
        });
        let key = bucket_key("test", "user");

        // level 6 of 10 at 2/s: ceil(4 / 2) + 10 seconds
        hit_times(&bucket, "user", 2.0, 10, 4).await;
        env.advance(Duration::from_secs(11));
        assert!(env.storage.exists(&key).await.unwrap());
        env.advance(Duration::from_secs(1));
        assert!(!env.storage.exists(&key).await.unwrap());

        assert_eq!(bucket.get("user", 2.0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_custom_deny_hint() {
        let env = TestEnv::new();
        let bucket = env.token_bucket().with_bucket_config(BucketConfig {
            ttl_buffer: Duration::from_secs(1),
            deny_retry_after: Duration::from_millis(250),
        });

        bucket.hit("user", 1.0, 1, 1).await.unwrap();
        assert_eq!(
            bucket.hit("user", 1.0, 1, 1).await.unwrap().retry_after(),
            Some(Duration::from_millis(250))
        );
    }

    #[tokio::test]
    async fn test_invalid_rate_is_rejected() {
        let env = TestEnv::new();
        let bucket = env.token_bucket();

        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = bucket.hit("user", rate, 5, 1).await.unwrap_err();
            assert!(matches!(err, RateLimiterError::Config(_)), "rate {}", rate);
        }
        assert!(env.storage.is_empty().unwrap());
    }
}
