//! Per-tool circuit breakers.
//!
//! One breaker per tool name, persisted in the execution shard's
//! `circuit_breakers` table. The in-memory breaker is a write-through
//! cache: every state change is flushed synchronously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::Shard;

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> State {
        match s {
            "open" => State::Open,
            "half_open" => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single tool's breaker. All fields are guarded by the per-tool lock
/// held in [`BreakerSet`]; the Open→HalfOpen transition happens inside
/// `can_execute` and resets the counters atomically.
#[derive(Debug)]
pub struct Breaker {
    pub name: String,
    pub state: State,
    pub failure_count: i64,
    pub success_count: i64,
    pub failure_threshold: i64,
    pub success_threshold: i64,
    pub timeout_seconds: i64,
    pub half_open_max_calls: i64,
    half_open_calls: i64,
    pub last_state_change: i64,
}

impl Breaker {
    fn with_defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: State::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold: 5,
            success_threshold: 3,
            timeout_seconds: 60,
            half_open_max_calls: 3,
            half_open_calls: 0,
            last_state_change: now_secs(),
        }
    }

    /// Admission check. In Open state the timeout elapsing flips the
    /// breaker to HalfOpen; in HalfOpen at most `half_open_max_calls`
    /// probes are admitted.
    pub fn can_execute(&mut self) -> Result<(), String> {
        match self.state {
            State::Closed => Ok(()),
            State::Open => {
                if now_secs() - self.last_state_change >= self.timeout_seconds {
                    self.state = State::HalfOpen;
                    self.success_count = 0;
                    self.half_open_calls = 0;
                    self.last_state_change = now_secs();
                    Ok(())
                } else {
                    Err(format!("circuit breaker {} is open", self.name))
                }
            }
            State::HalfOpen => {
                if self.half_open_calls >= self.half_open_max_calls {
                    return Err(format!(
                        "circuit breaker {}: half-open max calls reached",
                        self.name
                    ));
                }
                self.half_open_calls += 1;
                Ok(())
            }
        }
    }

    /// Record a successful call and flush.
    pub fn record_success(&mut self, shard: &Shard) {
        match self.state {
            State::Closed => self.failure_count = 0,
            State::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = State::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.last_state_change = now_secs();
                }
            }
            State::Open => {}
        }
        shard.exec_or_log(
            "UPDATE circuit_breakers
             SET state = ?1, failure_count = ?2, success_count = ?3,
                 last_success_at = strftime('%s', 'now'), last_state_change_at = ?4
             WHERE name = ?5",
            &[
                &self.state.as_str(),
                &self.failure_count,
                &self.success_count,
                &self.last_state_change,
                &self.name,
            ],
        );
    }

    /// Record a failed call and flush. A HalfOpen failure reopens
    /// immediately.
    pub fn record_failure(&mut self, shard: &Shard) {
        match self.state {
            State::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = State::Open;
                    self.last_state_change = now_secs();
                }
            }
            State::HalfOpen => {
                self.state = State::Open;
                self.success_count = 0;
                self.last_state_change = now_secs();
            }
            State::Open => {}
        }
        shard.exec_or_log(
            "UPDATE circuit_breakers
             SET state = ?1, failure_count = ?2, success_count = ?3,
                 last_failure_at = strftime('%s', 'now'), last_state_change_at = ?4
             WHERE name = ?5",
            &[
                &self.state.as_str(),
                &self.failure_count,
                &self.success_count,
                &self.last_state_change,
                &self.name,
            ],
        );
    }

    /// Force the breaker back to Closed.
    pub fn reset(&mut self, shard: &Shard) {
        self.state = State::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_calls = 0;
        self.last_state_change = now_secs();
        shard.exec_or_log(
            "UPDATE circuit_breakers
             SET state = 'closed', failure_count = 0, success_count = 0,
                 last_state_change_at = strftime('%s', 'now')
             WHERE name = ?1",
            &[&self.name],
        );
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "state": self.state.as_str(),
            "failure_count": self.failure_count,
            "success_count": self.success_count,
            "failure_threshold": self.failure_threshold,
            "success_threshold": self.success_threshold,
            "timeout_seconds": self.timeout_seconds,
            "last_state_change": self.last_state_change,
        })
    }

    #[cfg(test)]
    fn backdate(&mut self, secs: i64) {
        self.last_state_change -= secs;
    }
}

/// All breakers, keyed by tool name.
pub struct BreakerSet {
    shard: Shard,
    breakers: Mutex<HashMap<String, Arc<Mutex<Breaker>>>>,
}

impl BreakerSet {
    pub fn new(shard: Shard) -> Self {
        Self {
            shard,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Load every persisted breaker row.
    pub fn load_all(&self) -> rusqlite::Result<()> {
        let loaded = self.shard.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, state, failure_count, success_count,
                        failure_threshold, success_threshold, timeout_seconds,
                        last_state_change_at, half_open_max_calls
                 FROM circuit_breakers",
            )?;
            let rows = stmt.query_map([], |row| {
                let state: String = row.get(1)?;
                Ok(Breaker {
                    name: row.get(0)?,
                    state: State::parse(&state),
                    failure_count: row.get(2)?,
                    success_count: row.get(3)?,
                    failure_threshold: row.get(4)?,
                    success_threshold: row.get(5)?,
                    timeout_seconds: row.get(6)?,
                    half_open_max_calls: row.get(8)?,
                    half_open_calls: 0,
                    last_state_change: row.get(7)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut map = self.breakers.lock().unwrap();
        for b in loaded {
            map.insert(b.name.clone(), Arc::new(Mutex::new(b)));
        }
        Ok(())
    }

    /// Fetch the breaker for a tool, creating and persisting a default
    /// row on first use.
    pub fn acquire(&self, name: &str) -> Arc<Mutex<Breaker>> {
        let mut map = self.breakers.lock().unwrap();
        if let Some(b) = map.get(name) {
            return Arc::clone(b);
        }
        self.shard.exec_or_log(
            "INSERT OR IGNORE INTO circuit_breakers
                 (name, state, failure_count, success_count, failure_threshold,
                  success_threshold, timeout_seconds, last_state_change_at, half_open_max_calls)
             VALUES (?1, 'closed', 0, 0, 5, 3, 60, strftime('%s', 'now'), 3)",
            &[&name],
        );
        let breaker = Arc::new(Mutex::new(Breaker::with_defaults(name)));
        map.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Snapshot of every breaker's stats (toolbox `audit_system`).
    pub fn all_stats(&self) -> Vec<serde_json::Value> {
        let map = self.breakers.lock().unwrap();
        let mut stats: Vec<_> = map.values().map(|b| b.lock().unwrap().stats()).collect();
        stats.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn exec_shard() -> (tempfile::TempDir, Shard) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        (dir, storage.execution.clone())
    }

    #[test]
    fn test_closed_allows_and_failures_open() {
        let (_dir, shard) = exec_shard();
        let set = BreakerSet::new(shard.clone());
        let breaker = set.acquire("t");
        let mut b = breaker.lock().unwrap();

        for _ in 0..4 {
            assert!(b.can_execute().is_ok());
            b.record_failure(&shard);
            assert_eq!(b.state, State::Closed);
        }
        b.record_failure(&shard);
        assert_eq!(b.state, State::Open);
        assert!(b.can_execute().is_err());
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let (_dir, shard) = exec_shard();
        let set = BreakerSet::new(shard.clone());
        let breaker = set.acquire("t");
        let mut b = breaker.lock().unwrap();

        for _ in 0..5 {
            b.record_failure(&shard);
        }
        assert_eq!(b.state, State::Open);
        b.backdate(61);
        assert!(b.can_execute().is_ok());
        assert_eq!(b.state, State::HalfOpen);
    }

    #[test]
    fn test_half_open_success_path_closes() {
        let (_dir, shard) = exec_shard();
        let set = BreakerSet::new(shard.clone());
        let breaker = set.acquire("t");
        let mut b = breaker.lock().unwrap();

        for _ in 0..5 {
            b.record_failure(&shard);
        }
        b.backdate(61);
        assert!(b.can_execute().is_ok());
        b.record_success(&shard);
        assert_eq!(b.state, State::HalfOpen);
        assert!(b.can_execute().is_ok());
        b.record_success(&shard);
        assert!(b.can_execute().is_ok());
        b.record_success(&shard);
        assert_eq!(b.state, State::Closed);
        assert_eq!(b.success_count, 0);
        assert_eq!(b.failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (_dir, shard) = exec_shard();
        let set = BreakerSet::new(shard.clone());
        let breaker = set.acquire("t");
        let mut b = breaker.lock().unwrap();

        for _ in 0..5 {
            b.record_failure(&shard);
        }
        b.backdate(61);
        assert!(b.can_execute().is_ok());
        b.record_failure(&shard);
        assert_eq!(b.state, State::Open);
        assert!(b.can_execute().is_err());
    }

    #[test]
    fn test_half_open_admission_cap() {
        let (_dir, shard) = exec_shard();
        let set = BreakerSet::new(shard.clone());
        let breaker = set.acquire("t");
        let mut b = breaker.lock().unwrap();

        for _ in 0..5 {
            b.record_failure(&shard);
        }
        b.backdate(61);
        // The transition call is free; three half-open probes, then reject.
        assert!(b.can_execute().is_ok());
        assert!(b.can_execute().is_ok());
        assert!(b.can_execute().is_ok());
        assert!(b.can_execute().is_ok());
        assert!(b.can_execute().is_err());
    }

    #[test]
    fn test_state_survives_reload() {
        let (_dir, shard) = exec_shard();
        {
            let set = BreakerSet::new(shard.clone());
            let breaker = set.acquire("persisted");
            let mut b = breaker.lock().unwrap();
            for _ in 0..5 {
                b.record_failure(&shard);
            }
            assert_eq!(b.state, State::Open);
        }

        let set2 = BreakerSet::new(shard.clone());
        set2.load_all().unwrap();
        let breaker = set2.acquire("persisted");
        let b = breaker.lock().unwrap();
        assert_eq!(b.state, State::Open);
        assert_eq!(b.failure_count, 5);
    }
}
