// src/storage/scan.rs

use crate::error::Result;
use crate::storage::StorageBackend;

/// Outcome of one SCAN step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanProgress {
    /// The step found keys; more steps may follow
    Matches(Vec<String>),
    /// The step found nothing but the cursor is not finished
    NoMatches,
    /// The cursor wrapped back to 0; there is nothing left to visit
    Exhausted,
}

/// Resumable cursor over the keys matching a pattern on one node.
///
/// Large keyspaces routinely answer with empty steps long before the matches
/// show up, so an empty step must never be read as the end of the scan.
#[derive(Debug)]
pub struct KeyScan<'a, S> {
    storage: &'a S,
    pattern: String,
    count: usize,
    cursor: Option<u64>,
    steps: usize,
}

impl<'a, S: StorageBackend> KeyScan<'a, S> {
    pub fn new(storage: &'a S, pattern: impl Into<String>, count: usize) -> Self {
        Self {
            storage,
            pattern: pattern.into(),
            count,
            cursor: Some(0),
            steps: 0,
        }
    }

    /// Number of SCAN round trips issued so far
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub async fn next_step(&mut self) -> Result<ScanProgress> {
        let Some(cursor) = self.cursor else {
            return Ok(ScanProgress::Exhausted);
        };

        let (next, keys) = self.storage.scan(cursor, &self.pattern, self.count).await?;
        self.steps += 1;
        self.cursor = if next == 0 { None } else { Some(next) };

        match (keys.is_empty(), self.cursor) {
            (false, _) => Ok(ScanProgress::Matches(keys)),
            (true, Some(_)) => Ok(ScanProgress::NoMatches),
            (true, None) => Ok(ScanProgress::Exhausted),
        }
    }

    /// Drain the scan, collecting every matching key
    pub async fn collect_all(mut self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        loop {
            match self.next_step().await? {
                ScanProgress::Matches(keys) => found.extend(keys),
                ScanProgress::NoMatches => continue,
                ScanProgress::Exhausted => return Ok(found),
            }
        }
    }
}
