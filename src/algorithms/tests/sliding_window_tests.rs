#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        algorithms::{Decision, RateLimitAlgorithm, WindowAlgorithm},
        test_utils::{allowed_counts, hit_times, TestEnv},
    };

    #[tokio::test]
    async fn test_limit_reached_then_denied() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();
        let scale = Duration::from_secs(1);

        let decisions = hit_times(&limiter, "user", scale, 3, 4).await;
        assert_eq!(allowed_counts(&decisions), vec![1, 2, 3]);
        assert_eq!(
            decisions[3],
            Decision::Deny {
                retry_after: Duration::from_millis(1_000)
            }
        );
    }

    /// Only the entries older than the window drop out
    #[tokio::test]
    async fn test_old_entries_slide_out() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();
        let scale = Duration::from_secs(1);

        limiter.hit("user", scale, 2, 1).await.unwrap();
        env.advance(Duration::from_millis(500));
        limiter.hit("user", scale, 2, 1).await.unwrap();
        assert!(!limiter.hit("user", scale, 2, 1).await.unwrap().is_allowed());

        // first entry is now out of the window, the second is not
        env.advance(Duration::from_millis(600));
        assert_eq!(
            limiter.hit("user", scale, 2, 1).await.unwrap(),
            Decision::Allow { count: 2 }
        );
        assert!(!limiter.hit("user", scale, 2, 1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_log_expires_after_idle_window() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();
        let scale = Duration::from_secs(1);

        hit_times(&limiter, "user", scale, 3, 3).await;
        env.advance(Duration::from_millis(1_001));
        assert_eq!(limiter.get("user", scale).await.unwrap(), 0);
        assert!(env.storage.is_empty().unwrap());
    }

    /// `get` does not prune and can overcount until the next write
    #[tokio::test]
    async fn test_get_counts_stale_entries_until_next_write() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();
        let scale = Duration::from_secs(1);

        limiter.hit("user", scale, 10, 1).await.unwrap();
        env.advance(Duration::from_millis(600));
        limiter.hit("user", scale, 10, 1).await.unwrap();
        env.advance(Duration::from_millis(600));

        assert_eq!(limiter.get("user", scale).await.unwrap(), 2);
        assert_eq!(
            limiter.hit("user", scale, 10, 1).await.unwrap(),
            Decision::Allow { count: 2 }
        );
    }

    /// Entries added in the same millisecond never collide
    #[tokio::test]
    async fn test_inc_adds_distinct_entries() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();
        let scale = Duration::from_secs(5);

        assert_eq!(limiter.inc("user", scale, 5).await.unwrap(), 5);
        assert_eq!(limiter.inc("user", scale, 3).await.unwrap(), 8);
        assert_eq!(limiter.get("user", scale).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_set_replaces_the_log() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();
        let scale = Duration::from_secs(5);

        limiter.inc("user", scale, 9).await.unwrap();
        assert_eq!(limiter.set("user", scale, 2).await.unwrap(), 2);
        assert_eq!(limiter.get("user", scale).await.unwrap(), 2);
        assert_eq!(limiter.set("user", scale, 0).await.unwrap(), 0);
        assert_eq!(limiter.get("user", scale).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_windows_of_different_length_are_separate() {
        let env = TestEnv::new();
        let limiter = env.sliding_window();

        limiter.inc("user", Duration::from_secs(1), 4).await.unwrap();
        assert_eq!(limiter.get("user", Duration::from_secs(60)).await.unwrap(), 0);
    }
}
