// src/storage/tests/mod.rs


// Common utilities for storage tests
pub(crate) mod common {
    use std::collections::BTreeSet;

    use crate::algorithms::{reply_int, fixed_window::WINDOW_INCR};
    use crate::error::Result;
    use crate::storage::{KeyScan, ScanProgress, StorageBackend, StoragePipeline};

    // Test basic storage operations that should work on any backend
    pub async fn test_basic_operations<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let key = format!("{}:basic", ns);

        storage.set(&key, "test_value", None).await?;
        assert_eq!(storage.get(&key).await?.as_deref(), Some("test_value"));
        assert!(storage.exists(&key).await?);
        assert!(!storage.exists(&format!("{}:missing", ns)).await?);

        // hash and sorted set reads of absent keys are empty, not errors
        let absent = format!("{}:absent", ns);
        assert_eq!(storage.hget(&absent, "level").await?, None);
        assert!(storage.hgetall(&absent).await?.is_empty());
        assert_eq!(storage.zcard(&absent).await?, 0);

        let removed = storage
            .delete(&[key.clone(), format!("{}:missing", ns)])
            .await?;
        assert_eq!(removed, 1);
        assert!(!storage.exists(&key).await?);
        Ok(())
    }

    // Scripts run as one step and see their own writes
    pub async fn test_script_evaluation<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let key = format!("{}:script", ns);
        let keys = [key.clone()];

        let first = storage
            .eval(&WINDOW_INCR, &keys, &["2".to_string(), "60000".to_string()])
            .await?;
        assert_eq!(reply_int(&first, WINDOW_INCR.name)?, 2);
        let second = storage
            .eval(&WINDOW_INCR, &keys, &["3".to_string(), "60000".to_string()])
            .await?;
        assert_eq!(reply_int(&second, WINDOW_INCR.name)?, 5);
        assert_eq!(storage.get(&key).await?.as_deref(), Some("5"));

        storage.delete(&keys).await?;
        Ok(())
    }

    // Test pipeline operations that should work on any backend
    pub async fn test_pipeline_operations<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let keys: Vec<String> = (0..3).map(|i| format!("{}:pipe:{}", ns, i)).collect();
        for key in &keys {
            storage.set(key, "1", None).await?;
        }

        let mut pipeline = storage.pipeline();
        pipeline.atomic().delete(&keys[..2]).delete(&keys[..1]);
        let results = storage.execute_pipeline(pipeline).await?;

        assert_eq!(results.len(), 2);
        assert_eq!(reply_int(&results[0], "pipeline")?, 2);
        assert_eq!(reply_int(&results[1], "pipeline")?, 0);
        assert!(storage.exists(&keys[2]).await?);

        storage.delete(&keys).await?;
        Ok(())
    }

    // Keys deleted mid-scan never make the scan skip the others
    pub async fn test_scan_with_deletes<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let expected: BTreeSet<String> = (0..120).map(|i| format!("{}:scan:{:03}", ns, i)).collect();
        for key in &expected {
            storage.set(key, "1", None).await?;
        }

        let mut scan = KeyScan::new(storage, format!("{}:scan:*", ns), 10);
        let mut seen = BTreeSet::new();
        loop {
            match scan.next_step().await? {
                ScanProgress::Matches(keys) => {
                    storage.delete(&keys).await?;
                    seen.extend(keys);
                }
                ScanProgress::NoMatches => continue,
                ScanProgress::Exhausted => break,
            }
        }

        assert_eq!(seen, expected);
        assert!(KeyScan::new(storage, format!("{}:scan:*", ns), 10)
            .collect_all()
            .await?
            .is_empty());
        Ok(())
    }
}
