//! Matcher workers
//!
//! One worker per log source. Each owns its follower subprocess, runs
//! every inbound line through the rules of every module bound to that
//! source, and hands hits to the recorder and the warden. Workers never
//! touch the firewall gateway.

use crate::recorder::Recorder;
use crate::registry::{LogSource, Module};
use crate::tailer::{self, FollowerSet, RespawnState};
use crate::warden::Warden;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub struct MatcherWorker {
    slot: usize,
    source: LogSource,
    modules: Vec<Arc<Module>>,
    recorder: Recorder,
    warden: Arc<Warden>,
    followers: Arc<FollowerSet>,
    quit: Arc<AtomicBool>,
}

impl MatcherWorker {
    pub fn new(
        slot: usize,
        source: LogSource,
        modules: Vec<Arc<Module>>,
        recorder: Recorder,
        warden: Arc<Warden>,
        followers: Arc<FollowerSet>,
        quit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            slot,
            source,
            modules,
            recorder,
            warden,
            followers,
            quit,
        }
    }

    /// Blocking loop: tail the source until shutdown, respawning a dead
    /// follower with backoff
    pub fn run(self) {
        let mut respawn = RespawnState::new();
        info!(
            source = %self.source,
            modules = self.modules.len(),
            "matcher worker started"
        );

        loop {
            if self.quit.load(Ordering::Relaxed) {
                break;
            }

            let child = match tailer::spawn_follower(&self.source) {
                Ok(child) => child,
                Err(e) => {
                    warn!(source = %self.source, error = %e, "follower spawn failed");
                    if !self.pause(&mut respawn) {
                        error!(source = %self.source, "follower restart budget exhausted");
                        break;
                    }
                    continue;
                }
            };
            let mut reader = match self.followers.adopt(self.slot, child) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(source = %self.source, error = %e, "follower adopt failed");
                    if !self.pause(&mut respawn) {
                        break;
                    }
                    continue;
                }
            };

            let mut seen_line = false;
            loop {
                match tailer::read_line_lossy(&mut reader) {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        if !seen_line {
                            // The stream is alive; forget earlier failures
                            seen_line = true;
                            respawn.reset();
                        }
                        debug!(source = %self.source, raw = %line);
                        self.process_line(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(source = %self.source, error = %e, "follower read failed");
                        break;
                    }
                }
            }
            self.followers.reap(self.slot);

            if self.quit.load(Ordering::Relaxed) {
                break;
            }
            warn!(source = %self.source, "follower stopped unexpectedly");
            if !self.pause(&mut respawn) {
                error!(source = %self.source, "follower restart budget exhausted");
                break;
            }
        }

        info!(source = %self.source, "matcher worker stopped");
    }

    /// Back off before a respawn; false when the budget is spent or the
    /// daemon is quitting
    fn pause(&self, respawn: &mut RespawnState) -> bool {
        respawn.record_failure();
        if !respawn.should_retry() {
            return false;
        }
        let Some(delay) = respawn.next_delay() else {
            return false;
        };

        debug!(source = %self.source, ?delay, "respawning follower");
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.quit.load(Ordering::Relaxed) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        !self.quit.load(Ordering::Relaxed)
    }

    /// Run one line through every rule bound to this source
    ///
    /// A line may fire any number of rules across modules; each fire is an
    /// independent offense.
    pub fn process_line(&self, line: &str) {
        for module in &self.modules {
            for rule in &module.rules {
                if !rule.matches(line) {
                    continue;
                }
                let Some(ip) = rule.extract_ip(line) else {
                    continue;
                };
                let user = rule.extract_user(line);

                if let Err(e) = self.recorder.record(module, rule, line, ip, user) {
                    warn!(module = %module.name, %ip, error = %e, "offense record failed");
                    continue;
                }
                match self.warden.observe(module, ip) {
                    Ok(verdict) => {
                        debug!(module = %module.name, %ip, ?verdict, "observed")
                    }
                    Err(e) => warn!(module = %module.name, %ip, error = %e, "observe failed"),
                }
            }
        }
    }
}
