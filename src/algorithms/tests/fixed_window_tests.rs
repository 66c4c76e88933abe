#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        algorithms::{Decision, RateLimitAlgorithm, WindowAlgorithm},
        error::RateLimiterError,
        keys::window_key,
        storage::StorageBackend,
        test_utils::{allowed_counts, hit_times, TestEnv, TEST_START_MS},
    };

    /// Five hits fit a limit of five; the sixth waits for the window to end
    #[tokio::test]
    async fn test_limit_reached_then_denied() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);

        let decisions = hit_times(&limiter, "user", scale, 5, 5).await;
        assert_eq!(allowed_counts(&decisions), vec![1, 2, 3, 4, 5]);

        let sixth = limiter.hit("user", scale, 5, 1).await.unwrap();
        let retry_after = sixth.retry_after().expect("sixth hit should be denied");
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= scale);
    }

    #[tokio::test]
    async fn test_retry_after_is_time_left_in_window() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);

        env.advance(Duration::from_millis(2_500));
        limiter.hit("user", scale, 1, 1).await.unwrap();
        let denied = limiter.hit("user", scale, 1, 1).await.unwrap();
        assert_eq!(
            denied,
            Decision::Deny {
                retry_after: Duration::from_millis(7_500)
            }
        );
    }

    /// Consecutive windows count independently
    #[tokio::test]
    async fn test_windows_are_independent() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);

        hit_times(&limiter, "user", scale, 3, 4).await;
        assert_eq!(limiter.get("user", scale).await.unwrap(), 4);

        env.advance(scale);
        assert_eq!(limiter.get("user", scale).await.unwrap(), 0);
        assert_eq!(
            limiter.hit("user", scale, 3, 1).await.unwrap(),
            Decision::Allow { count: 1 }
        );
    }

    /// The counter expires when its window ends, however late it was last hit
    #[tokio::test]
    async fn test_counter_expires_at_window_end() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);
        let key = window_key("test", "user", TEST_START_MS / 10_000);

        limiter.hit("user", scale, 100, 1).await.unwrap();
        env.advance(Duration::from_millis(9_000));
        limiter.hit("user", scale, 100, 1).await.unwrap();
        assert!(env.storage.exists(&key).await.unwrap());

        env.advance(Duration::from_millis(1_000));
        assert!(!env.storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(30);

        assert_eq!(limiter.get("user", scale).await.unwrap(), 0);
        assert_eq!(limiter.set("user", scale, 17).await.unwrap(), 17);
        assert_eq!(limiter.get("user", scale).await.unwrap(), 17);

        // the counter keeps going from the value that was set
        assert_eq!(limiter.inc("user", scale, 3).await.unwrap(), 20);
        assert!(!limiter.hit("user", scale, 20, 1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_hit_with_larger_increment() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);

        assert_eq!(
            limiter.hit("user", scale, 10, 7).await.unwrap(),
            Decision::Allow { count: 7 }
        );
        assert!(!limiter.hit("user", scale, 10, 4).await.unwrap().is_allowed());
        // the denied increment was still counted
        assert_eq!(limiter.get("user", scale).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_zero_scale_is_rejected() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();

        let err = limiter.hit("user", Duration::ZERO, 5, 1).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(_)));
    }

    /// A window longer than u64 milliseconds is refused, not truncated
    #[tokio::test]
    async fn test_oversized_scale_is_rejected() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();

        let err = limiter.hit("user", Duration::MAX, 5, 1).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(_)));
        let err = limiter.get("user", Duration::MAX).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(_)));
        assert!(env.storage.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_a_protocol_error() {
        let env = TestEnv::new();
        let limiter = env.fixed_window();
        let scale = Duration::from_secs(10);
        let key = window_key("test", "user", TEST_START_MS / 10_000);

        env.storage.set(&key, "not-a-number", None).await.unwrap();
        let err = limiter.get("user", scale).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::Protocol(_)));
    }
}
