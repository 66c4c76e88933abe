// src/storage/keyspace.rs

// Redis-shaped data model behind MemoryStorage. Only the commands the
// engines and the legacy backend issue are modelled.
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{RateLimiterError, Result, StorageError};

const MAX_SCAN_SESSIONS: usize = 1024;

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    SortedSet(Vec<(f64, String)>),
}

#[derive(Debug)]
struct Entry {
    data: Data,
    expires_at: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct Keyspace {
    entries: BTreeMap<String, Entry>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    // SCAN cursors resume after the last key they examined, so deleting
    // keys mid-scan never makes later keys shift out of view
    scan_sessions: HashMap<u64, String>,
    session_order: VecDeque<u64>,
    next_cursor: u64,
}

fn wrong_type() -> RateLimiterError {
    RateLimiterError::Storage(StorageError::RedisCommand(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    ))
}

fn not_an_integer() -> RateLimiterError {
    RateLimiterError::Storage(StorageError::RedisCommand(
        "ERR value is not an integer or out of range".to_string(),
    ))
}

impl Keyspace {
    pub(crate) fn new(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            clock,
            max_entries,
            scan_sessions: HashMap::new(),
            session_order: VecDeque::new(),
            next_cursor: 1,
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Drop every expired entry, returning how many were removed
    pub(crate) fn purge_expired(&mut self) -> usize {
        let now = self.now_ms();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        before - self.entries.len()
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.map_or(false, |at| at <= now),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn create(&mut self, key: &str, data: Data) -> Result<&mut Entry> {
        if self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                return Err(RateLimiterError::Storage(StorageError::RedisCommand(
                    "Maximum entries limit exceeded".to_string(),
                )));
            }
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                data,
                expires_at: None,
            },
        );
        self.entries
            .get_mut(key)
            .ok_or_else(|| RateLimiterError::Internal("entry vanished after insert".to_string()))
    }

    fn live_or_create(&mut self, key: &str, empty: Data) -> Result<&mut Entry> {
        if self.live(key).is_none() {
            return self.create(key, empty);
        }
        self.entries
            .get_mut(key)
            .ok_or_else(|| RateLimiterError::Internal("entry vanished".to_string()))
    }

    pub(crate) fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    pub(crate) fn del(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }

    /// Remaining lifetime in ms; -2 when absent, -1 when persistent
    pub(crate) fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now_ms();
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_sub(now) as i64,
        }
    }

    pub(crate) fn pexpire(&mut self, key: &str, ttl_ms: u64) -> bool {
        let now = self.now_ms();
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl_ms);
                true
            }
            None => false,
        }
    }

    // strings

    pub(crate) fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    pub(crate) fn set(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<()> {
        let now = self.now_ms();
        self.live(key);
        let entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => self.create(key, Data::Str(String::new()))?,
        };
        entry.data = Data::Str(value.to_string());
        entry.expires_at = ttl_ms.map(|ttl| now + ttl);
        Ok(())
    }

    pub(crate) fn incr_by(&mut self, key: &str, amount: i64) -> Result<i64> {
        let entry = self.live_or_create(key, Data::Str("0".to_string()))?;
        match &mut entry.data {
            Data::Str(value) => {
                let current: i64 = value.parse().map_err(|_| not_an_integer())?;
                let next = current.checked_add(amount).ok_or_else(not_an_integer)?;
                *value = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type()),
        }
    }

    // hashes

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Hash(fields),
                ..
            }) => Ok(Some(fields)),
            Some(_) => Err(wrong_type()),
        }
    }

    pub(crate) fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash(key)?.and_then(|fields| fields.get(field).cloned()))
    }

    pub(crate) fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hash(key)?.cloned().unwrap_or_default())
    }

    pub(crate) fn hset(&mut self, key: &str, pairs: &[(&str, String)]) -> Result<()> {
        let entry = self.live_or_create(key, Data::Hash(HashMap::new()))?;
        match &mut entry.data {
            Data::Hash(fields) => {
                for (field, value) in pairs {
                    fields.insert((*field).to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type()),
        }
    }

    pub(crate) fn hincr_by(&mut self, key: &str, field: &str, amount: i64) -> Result<i64> {
        let entry = self.live_or_create(key, Data::Hash(HashMap::new()))?;
        match &mut entry.data {
            Data::Hash(fields) => {
                let current: i64 = match fields.get(field) {
                    Some(raw) => raw.parse().map_err(|_| not_an_integer())?,
                    None => 0,
                };
                let next = current.checked_add(amount).ok_or_else(not_an_integer)?;
                fields.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(wrong_type()),
        }
    }

    // sets

    pub(crate) fn sadd(&mut self, key: &str, member: &str) -> Result<bool> {
        let entry = self.live_or_create(key, Data::Set(BTreeSet::new()))?;
        match &mut entry.data {
            Data::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(wrong_type()),
        }
    }

    pub(crate) fn srem(&mut self, key: &str, member: &str) -> Result<bool> {
        let (removed, now_empty) = match self.live(key) {
            None => return Ok(false),
            Some(Entry {
                data: Data::Set(members),
                ..
            }) => (members.remove(member), members.is_empty()),
            Some(_) => return Err(wrong_type()),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    // sorted sets

    pub(crate) fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<bool> {
        let entry = self.live_or_create(key, Data::SortedSet(Vec::new()))?;
        match &mut entry.data {
            Data::SortedSet(items) => {
                if let Some(existing) = items.iter_mut().find(|(_, m)| m == member) {
                    existing.0 = score;
                    return Ok(false);
                }
                items.push((score, member.to_string()));
                Ok(true)
            }
            _ => Err(wrong_type()),
        }
    }

    pub(crate) fn zcard(&mut self, key: &str) -> Result<u64> {
        match self.live(key) {
            None => Ok(0),
            Some(Entry {
                data: Data::SortedSet(items),
                ..
            }) => Ok(items.len() as u64),
            Some(_) => Err(wrong_type()),
        }
    }

    /// ZREMRANGEBYSCORE key -inf (cutoff
    pub(crate) fn zrem_scored_before(&mut self, key: &str, cutoff: f64) -> Result<u64> {
        let (removed, now_empty) = match self.live(key) {
            None => return Ok(0),
            Some(Entry {
                data: Data::SortedSet(items),
                ..
            }) => {
                let before = items.len();
                items.retain(|(score, _)| *score >= cutoff);
                ((before - items.len()) as u64, items.is_empty())
            }
            Some(_) => return Err(wrong_type()),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    // keyspace iteration

    /// One SCAN step examining at most `count` keys in key order.
    pub(crate) fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> (u64, Vec<String>) {
        let resume_after = if cursor == 0 {
            None
        } else {
            match self.scan_sessions.remove(&cursor) {
                Some(last) => Some(last),
                // unknown cursor: nothing left to report
                None => return (0, Vec::new()),
            }
        };

        let now = self.now_ms();
        let lower = match &resume_after {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Unbounded,
        };

        let mut examined = 0;
        let mut last_seen = None;
        let mut matched = Vec::new();
        for (key, entry) in self
            .entries
            .range::<String, _>((lower, Bound::Unbounded))
        {
            if examined == count.max(1) {
                break;
            }
            examined += 1;
            last_seen = Some(key.clone());
            let alive = entry.expires_at.map_or(true, |at| at > now);
            if alive && glob_match(pattern.as_bytes(), key.as_bytes()) {
                matched.push(key.clone());
            }
        }

        let exhausted = match &last_seen {
            None => true,
            Some(last) => self
                .entries
                .range::<String, _>((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next()
                .is_none(),
        };

        match last_seen {
            Some(last) if !exhausted => (self.open_scan_session(last), matched),
            _ => (0, matched),
        }
    }

    fn open_scan_session(&mut self, last: String) -> u64 {
        let cursor = self.next_cursor;
        self.next_cursor += 1;
        self.scan_sessions.insert(cursor, last);
        self.session_order.push_back(cursor);
        while self.session_order.len() > MAX_SCAN_SESSIONS {
            if let Some(oldest) = self.session_order.pop_front() {
                self.scan_sessions.remove(&oldest);
            }
        }
        cursor
    }
}

/// Redis-style glob matching: `*`, `?`, `[...]` classes with ranges and
/// `^` negation, and `\` escapes.
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            let rest = &pattern[1..];
            (0..=text.len()).any(|skip| glob_match(rest, &text[skip..]))
        }
        Some(b'?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some(b'[') => {
            let Some((&c, text_rest)) = text.split_first() else {
                return false;
            };
            match match_class(&pattern[1..], c) {
                Some((true, pattern_rest)) => glob_match(pattern_rest, text_rest),
                _ => false,
            }
        }
        Some(b'\\') if pattern.len() > 1 => {
            !text.is_empty() && text[0] == pattern[1] && glob_match(&pattern[2..], &text[1..])
        }
        Some(&p) => !text.is_empty() && text[0] == p && glob_match(&pattern[1..], &text[1..]),
    }
}

// Returns whether `c` is in the class and the pattern after the closing `]`
fn match_class(pattern: &[u8], c: u8) -> Option<(bool, &[u8])> {
    let (negate, mut i) = match pattern.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };
    let mut found = false;
    while i < pattern.len() {
        match pattern[i] {
            b']' => return Some((found != negate, &pattern[i + 1..])),
            b'\\' if i + 1 < pattern.len() => {
                found |= pattern[i + 1] == c;
                i += 2;
            }
            start if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' => {
                let end = pattern[i + 2];
                let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                found |= (lo..=hi).contains(&c);
                i += 3;
            }
            other => {
                found |= other == c;
                i += 1;
            }
        }
    }
    // unterminated class
    None
}
