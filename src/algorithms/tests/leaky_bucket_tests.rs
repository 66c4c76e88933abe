#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        algorithms::{Decision, RateLimitAlgorithm},
        keys::bucket_key,
        storage::StorageBackend,
        test_utils::{allowed_counts, hit_times, TestEnv},
    };

    #[tokio::test]
    async fn test_fresh_bucket_starts_empty() {
        let env = TestEnv::new();
        let bucket = env.leaky_bucket();

        assert_eq!(bucket.get("user", 1.0).await.unwrap(), 0);
        let decisions = hit_times(&bucket, "user", 1.0, 3, 4).await;
        assert_eq!(allowed_counts(&decisions), vec![1, 2, 3]);
        assert_eq!(
            decisions[3],
            Decision::Deny {
                retry_after: Duration::from_millis(1_000)
            }
        );
    }

    /// A full bucket refuses until enough has leaked out
    #[tokio::test]
    async fn test_full_bucket_drains_over_time() {
        let env = TestEnv::new();
        let bucket = env.leaky_bucket();

        assert_eq!(
            bucket.hit("user", 0.5, 4, 4).await.unwrap(),
            Decision::Allow { count: 4 }
        );
        assert!(!bucket.hit("user", 0.5, 4, 1).await.unwrap().is_allowed());

        // ceil(1 / 0.5) seconds leaks one unit
        env.advance(Duration::from_secs(2));
        assert_eq!(
            bucket.hit("user", 0.5, 4, 1).await.unwrap(),
            Decision::Allow { count: 4 }
        );
    }

    /// Fractional levels are stored as-is and floored when reported
    #[tokio::test]
    async fn test_fractional_leak() {
        let env = TestEnv::new();
        let bucket = env.leaky_bucket();

        bucket.hit("user", 0.5, 10, 4).await.unwrap();
        env.advance(Duration::from_secs(1));
        assert_eq!(
            bucket.hit("user", 0.5, 10, 1).await.unwrap(),
            Decision::Allow { count: 4 }
        );
        assert_eq!(bucket.get("user", 0.5).await.unwrap(), 4);

        let raw = env
            .storage
            .hget(&bucket_key("test", "user"), "level")
            .await
            .unwrap();
        assert_eq!(raw.as_deref(), Some("4.5"));
    }

    /// The level never drops below zero however long the bucket sat idle
    #[tokio::test]
    async fn test_level_floors_at_zero() {
        let env = TestEnv::new();
        let bucket = env.leaky_bucket();

        bucket.hit("user", 1.0, 5, 2).await.unwrap();
        env.advance(Duration::from_secs(9));
        assert_eq!(
            bucket.hit("user", 1.0, 5, 1).await.unwrap(),
            Decision::Allow { count: 1 }
        );
    }

    /// Admission looks at the level before pouring, so one hit may overfill
    #[tokio::test]
    async fn test_single_hit_can_overfill() {
        let env = TestEnv::new();
        let bucket = env.leaky_bucket();

        bucket.hit("user", 1.0, 5, 4).await.unwrap();
        assert_eq!(
            bucket.hit("user", 1.0, 5, 3).await.unwrap(),
            Decision::Allow { count: 7 }
        );
        assert!(!bucket.hit("user", 1.0, 5, 1).await.unwrap().is_allowed());
    }

    /// The bucket lives until it would be empty plus the buffer
    #[tokio::test]
    async fn test_bucket_expires_once_drained() {
        let env = TestEnv::new();
        let bucket = env.leaky_bucket();
        let key = bucket_key("test", "user");

        // level 3 at 1/s: ceil(3 / 1) + 10 seconds
        hit_times(&bucket, "user", 1.0, 5, 3).await;
        env.advance(Duration::from_secs(12));
        assert!(env.storage.exists(&key).await.unwrap());
        env.advance(Duration::from_secs(1));
        assert!(!env.storage.exists(&key).await.unwrap());
    }
}
