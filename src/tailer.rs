//! Log followers
//!
//! One subprocess per distinct log source: the shared journal stream for
//! modules without a source file, `tail -f` for each distinct file. Both
//! start at the current end of stream, so backlog is never replayed.
//! Followers are parked in a shared set so the supervisor can terminate
//! them at shutdown, which EOFs the matcher workers out of their reads.

use crate::error::{Error, Result};
use crate::registry::LogSource;
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use rand::rng;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Spawn the follower subprocess for a log source
pub fn spawn_follower(source: &LogSource) -> Result<Child> {
    let failed = |reason: String| Error::TailerFailed {
        source_name: source.to_string(),
        reason,
    };

    let mut cmd = match source {
        LogSource::Journal => {
            let mut cmd = Command::new("journalctl");
            cmd.args(["-f", "-n", "0"]);
            cmd
        }
        LogSource::File(path) => {
            if !path.exists() {
                return Err(failed("no such directory or file".to_string()));
            }
            let mut cmd = Command::new("tail");
            cmd.args(["-f", "-n", "0"]).arg(path);
            cmd
        }
    };

    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    debug!(%source, pid = child.id(), "follower started");
    Ok(child)
}

/// Live followers, keyed by worker slot
#[derive(Default)]
pub struct FollowerSet {
    children: Mutex<HashMap<usize, Child>>,
}

impl FollowerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Child>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the follower's stdout for reading and park the child
    ///
    /// Replaces (and reaps) any previous follower in the same slot.
    pub fn adopt(&self, slot: usize, mut child: Child) -> Result<BufReader<ChildStdout>> {
        let stdout = child.stdout.take().ok_or_else(|| Error::TailerFailed {
            source_name: format!("slot {}", slot),
            reason: "follower has no stdout".to_string(),
        })?;

        if let Some(mut previous) = self.lock().insert(slot, child) {
            let _ = previous.kill();
            let _ = previous.wait();
        }
        Ok(BufReader::new(stdout))
    }

    /// Reap a follower that stopped on its own
    pub fn reap(&self, slot: usize) {
        if let Some(mut child) = self.lock().remove(&slot) {
            let _ = child.wait();
        }
    }

    /// SIGTERM every live follower and reap it
    pub fn terminate_all(&self) {
        let mut children = self.lock();
        for (_, mut child) in children.drain() {
            let pid = Pid::from_raw(child.id() as i32);
            if signal::kill(pid, Signal::SIGTERM).is_err() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

/// Restart pacing for a follower that keeps dying
pub struct RespawnState {
    attempts: u8,
    backoff: ExponentialBackoff,
}

impl RespawnState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            backoff: ExponentialBackoff::new()
                .base_delay_ms(1000)
                .max_delay_ms(60000)
                .multiplier(2.0)
                .max_attempts(10)
                .jitter_factor(0.5),
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn should_retry(&self) -> bool {
        self.backoff.should_retry(self.attempts)
    }

    pub fn next_delay(&self) -> Option<Duration> {
        let mut rng = rng();
        self.backoff
            .delay(self.attempts, &mut rng)
            .map(Duration::from_millis)
    }
}

impl Default for RespawnState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the next line, replacing malformed bytes; `None` at end of stream
pub fn read_line_lossy(reader: &mut impl BufRead) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).trim().to_string()))
}
