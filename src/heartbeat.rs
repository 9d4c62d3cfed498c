//! Heartbeat
//!
//! The periodic tick of the daemon. Every pulse it releases expired
//! jails, reconciles the chain with the jail table, drains the HQ report
//! queue, pings HQ on schedule and prunes stale rows. Store trouble
//! inside a tick is logged and retried on the next one.

use crate::clock;
use crate::error::Result;
use crate::hq::{HqClient, ReportOutcome};
use crate::registry::Whitelist;
use crate::store::{PendingRow, Store};
use crate::warden::{SENTINEL_IP, Warden};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum spacing between consecutive HQ report deliveries
const REPORT_GAP: Duration = Duration::from_millis(1500);

/// Offenses older than this are pruned
const OFFENSE_RETENTION_HOURS: i64 = 24;

pub struct Heartbeat {
    store: Arc<Store>,
    warden: Arc<Warden>,
    hq: Arc<HqClient>,
    /// Union of the global and every module whitelist
    whitelist: Whitelist,
    pulse: u64,
    hq_pulse_every: u64,
    quit: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn new(
        store: Arc<Store>,
        warden: Arc<Warden>,
        hq: Arc<HqClient>,
        whitelist: Whitelist,
        pulse: u64,
        hq_pulse_every: u64,
        quit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            warden,
            hq,
            whitelist,
            pulse,
            hq_pulse_every,
            quit,
        }
    }

    /// Blocking loop; runs until the quit flag is set
    pub fn run(self) {
        info!(pulse = self.pulse, "heartbeat started");
        let mut ticks: u64 = 0;

        while !self.quit.load(Ordering::Relaxed) {
            if !self.sleep_pulse() {
                break;
            }
            ticks += 1;
            self.tick(ticks);
        }

        info!("heartbeat stopped");
    }

    /// Sleep one pulse in short slices; false when quitting
    fn sleep_pulse(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(self.pulse);
        while Instant::now() < deadline {
            if self.quit.load(Ordering::Relaxed) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        true
    }

    fn tick(&self, ticks: u64) {
        match self.warden.release_expired() {
            Ok(0) => {}
            Ok(released) => debug!(released, "expired jails released"),
            Err(e) => warn!(error = %e, "release pass failed"),
        }
        if let Err(e) = self.warden.reconcile() {
            warn!(error = %e, "reconcile pass failed");
        }

        if self.hq.reporting_enabled()
            && let Err(e) = self.drain_reports()
        {
            warn!(error = %e, "report drain failed");
        }

        if ticks % self.hq_pulse_every == 0 && self.hq.active() {
            self.hq.ping();
        }

        if let Err(e) = self.prune() {
            warn!(error = %e, "prune pass failed");
        }
    }

    /// Deliver queued reports to HQ, one call per 1.5 seconds
    fn drain_reports(&self) -> Result<()> {
        let pending = self.store.pending_reports()?;
        let mut delivered_one = false;

        for row in pending {
            if self.quit.load(Ordering::Relaxed) {
                break;
            }

            let Some(offense) = self.store.offense_by_id(row.id_log)? else {
                // Dangling reference, nothing to deliver
                self.store.remove_pending_report(row.id)?;
                continue;
            };

            if delivered_one {
                std::thread::sleep(REPORT_GAP);
            }
            delivered_one = true;

            let outcome = self.hq.report(&offense);
            self.apply_outcome(row, &offense.ip_address, outcome)?;
        }
        Ok(())
    }

    /// Fold one delivery outcome back into the store
    fn apply_outcome(&self, row: PendingRow, ip: &str, outcome: ReportOutcome) -> Result<()> {
        match outcome {
            ReportOutcome::Delivered {
                ab_score,
                total_reports,
            } => {
                self.store.upsert_hq_info(ip, ab_score, total_reports)?;
                self.store.remove_pending_report(row.id)?;
            }
            ReportOutcome::Rejected { .. } => {
                // No retry; a poisoned report would block the queue forever
                self.store.remove_pending_report(row.id)?;
            }
            ReportOutcome::Unavailable => {
                // Kept for the next tick
            }
        }
        Ok(())
    }

    /// Drop sentinel, whitelisted and stale rows
    fn prune(&self) -> Result<()> {
        let mut offenses = self
            .store
            .prune_offenses_for_ip(&SENTINEL_IP.to_string())?;

        if !self.whitelist.is_empty() {
            for ip_text in self.store.distinct_offense_ips()? {
                if let Ok(ip) = ip_text.parse()
                    && self.whitelist.contains(ip)
                {
                    offenses += self.store.prune_offenses_for_ip(&ip_text)?;
                }
            }
            for ip_text in self.store.distinct_hq_ips()? {
                if let Ok(ip) = ip_text.parse()
                    && self.whitelist.contains(ip)
                {
                    self.store.remove_hq_info(&ip_text)?;
                }
            }
        }

        let aged = self
            .store
            .prune_offenses_before(&clock::minus_hours(OFFENSE_RETENTION_HOURS))?;
        let dangling = self.store.prune_dangling_reports()?;

        if offenses + aged + dangling > 0 {
            debug!(offenses, aged, dangling, "pruned stale rows");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Chain, MemoryChain};

    fn fixture(whitelist: &[&str]) -> (tempfile::TempDir, Arc<Store>, Arc<MemoryChain>, Heartbeat) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("software.db")).unwrap());
        let chain = Arc::new(MemoryChain::new());
        let warden = Arc::new(Warden::new(
            Arc::clone(&store),
            Arc::clone(&chain) as Arc<dyn Chain>,
            Whitelist::default(),
        ));
        let hq = Arc::new(HqClient::new(None, "host".into(), "2.1.0".into()));
        let wl = Whitelist::parse(
            &whitelist.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();

        let hb = Heartbeat::new(
            Arc::clone(&store),
            warden,
            hq,
            wl,
            1,
            12,
            Arc::new(AtomicBool::new(false)),
        );
        (dir, store, chain, hb)
    }

    fn offense(store: &Store, ip: &str) -> i64 {
        store
            .record_offense(&clock::sdatetime(), "18", "line", "sshd", ip, "kw", "")
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_tick_releases_expired_jails() {
        let (_dir, store, chain, hb) = fixture(&[]);
        let created = clock::format(clock::plus_seconds(clock::now(), -130));
        store.record_jail(&created, "sshd", "198.51.100.9", 120).unwrap();
        store
            .record_jail_log(&created, "sshd", "198.51.100.9", 120)
            .unwrap();
        chain.add("198.51.100.9".parse().unwrap()).unwrap();

        hb.tick(1);

        assert!(store.jail_for_ip("198.51.100.9").unwrap().is_none());
        assert!(chain.entries().unwrap().is_empty());
        assert_eq!(store.jail_history().unwrap().len(), 1);
    }

    #[test]
    fn test_delivered_outcome_upserts_and_dequeues() {
        let (_dir, store, _chain, hb) = fixture(&[]);
        let id = offense(&store, "192.0.2.7");
        store.enqueue_report(id).unwrap();
        let row = store.pending_reports().unwrap()[0];

        hb.apply_outcome(
            row,
            "192.0.2.7",
            ReportOutcome::Delivered { ab_score: 95, total_reports: 2 },
        )
        .unwrap();

        let info = store.hq_info("192.0.2.7").unwrap().unwrap();
        assert_eq!(info.ab_score, 95);
        assert_eq!(store.pending_report_count().unwrap(), 0);
    }

    #[test]
    fn test_rejected_outcome_dequeues_without_upsert() {
        let (_dir, store, _chain, hb) = fixture(&[]);
        let id = offense(&store, "192.0.2.7");
        store.enqueue_report(id).unwrap();
        let row = store.pending_reports().unwrap()[0];

        hb.apply_outcome(
            row,
            "192.0.2.7",
            ReportOutcome::Rejected { code: 403, message: "bad key".into() },
        )
        .unwrap();

        assert!(store.hq_info("192.0.2.7").unwrap().is_none());
        assert_eq!(store.pending_report_count().unwrap(), 0);
    }

    #[test]
    fn test_unavailable_outcome_keeps_queue() {
        let (_dir, store, _chain, hb) = fixture(&[]);
        for _ in 0..5 {
            let id = offense(&store, "192.0.2.7");
            store.enqueue_report(id).unwrap();
        }

        // An HQ outage leaves every report queued for the next tick
        for row in store.pending_reports().unwrap() {
            hb.apply_outcome(row, "192.0.2.7", ReportOutcome::Unavailable)
                .unwrap();
        }

        assert_eq!(store.pending_report_count().unwrap(), 5);
        assert!(store.hq_info("192.0.2.7").unwrap().is_none());
    }

    #[test]
    fn test_prune_sentinel_and_whitelisted() {
        let (_dir, store, _chain, hb) = fixture(&["10.0.0.1"]);
        offense(&store, "0.0.0.0");
        offense(&store, "10.0.0.1");
        offense(&store, "203.0.113.5");
        store.upsert_hq_info("10.0.0.1", 50, 1).unwrap();
        store.upsert_hq_info("203.0.113.5", 50, 1).unwrap();

        hb.prune().unwrap();

        assert_eq!(store.distinct_offense_ips().unwrap(), vec!["203.0.113.5"]);
        assert!(store.hq_info("10.0.0.1").unwrap().is_none());
        assert!(store.hq_info("203.0.113.5").unwrap().is_some());
    }

    #[test]
    fn test_prune_aged_offenses_and_dangling_reports() {
        let (_dir, store, _chain, hb) = fixture(&[]);
        let old = clock::minus_hours(25);
        let id = store
            .record_offense(&old, "18", "line", "sshd", "203.0.113.5", "kw", "")
            .unwrap()
            .unwrap();
        store.enqueue_report(id).unwrap();
        offense(&store, "198.51.100.9");

        hb.prune().unwrap();

        // Only the day-old offense and its now-dangling report are gone
        assert_eq!(store.distinct_offense_ips().unwrap(), vec!["198.51.100.9"]);
        assert_eq!(store.pending_report_count().unwrap(), 0);
    }

    #[test]
    fn test_drain_removes_dangling_reference_without_call() {
        let (_dir, store, _chain, hb) = fixture(&[]);
        let id = offense(&store, "203.0.113.5");
        store.enqueue_report(id).unwrap();
        store.prune_offenses_for_ip("203.0.113.5").unwrap();

        hb.drain_reports().unwrap();
        assert_eq!(store.pending_report_count().unwrap(), 0);
    }
}
