//! The Warden - jail manager
//!
//! Decides when an address gets jailed, installs and removes firewall
//! rules, and keeps the jail table and the chain reconciled. One mutex
//! guards the whole observe-to-jail critical section, so concurrent
//! observations of the same address cannot double-install a rule.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use state_machines::state_machine;
use tracing::{debug, info, warn};

use crate::clock;
use crate::error::Result as CrateResult;
use crate::firewall::Chain;
use crate::registry::{Module, Whitelist};
use crate::store::Store;

/// Address reported when the offender could not be located on the line
pub const SENTINEL_IP: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

/// Non-jailed cells idle this long are forgotten
const CELL_IDLE_SECS: i64 = 3600;

state_machine! {
    name: CellMachine,
    dynamic: true,  // Runtime dispatch: transitions are driven by log traffic
    initial: Unseen,
    states: [Unseen, Observing, Jailed, Expired],
    events {
        observe {
            transition: { from: Unseen, to: Observing }
        }
        jail {
            transition: { from: [Unseen, Observing], to: Jailed }
        }
        expire {
            transition: { from: Jailed, to: Expired }
        }
        release {
            transition: { from: Expired, to: Unseen }
        }
    }
}

/// Outcome of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The address crossed a threshold and a rule was installed
    Jailed,
    /// The address is already jailed
    AlreadyJailed,
    /// Counted, below every threshold
    Observing,
    /// Sentinel or whitelisted address
    Ignored,
}

/// Lifecycle tracking for one (module, address) pair
struct Cell {
    machine: DynamicCellMachine<()>,
    last_seen: NaiveDateTime,
}

impl Cell {
    fn new() -> Self {
        Self {
            machine: CellMachine::new(()).into_dynamic(),
            last_seen: clock::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = clock::now();
    }

    fn observe(&mut self) {
        if self.machine.current_state() == "Unseen" {
            let _ = self.machine.handle(CellMachineEvent::Observe);
        }
    }

    fn jail(&mut self) {
        if self.machine.current_state() != "Jailed" {
            let _ = self.machine.handle(CellMachineEvent::Jail);
        }
    }

    fn is_jailed(&self) -> bool {
        self.machine.current_state() == "Jailed"
    }

    /// Jailed -> Expired -> Unseen; the cell is dropped by the caller
    fn expire(&mut self) {
        if self.is_jailed() {
            let _ = self.machine.handle(CellMachineEvent::Expire);
            let _ = self.machine.handle(CellMachineEvent::Release);
        }
    }
}

type CellKey = (String, Ipv4Addr);

/// The Warden mediates between the offense table, the firewall chain and
/// the jail table
pub struct Warden {
    store: Arc<Store>,
    chain: Arc<dyn Chain>,
    whitelist: Whitelist,
    cells: Mutex<HashMap<CellKey, Cell>>,
}

impl Warden {
    pub fn new(store: Arc<Store>, chain: Arc<dyn Chain>, whitelist: Whitelist) -> Self {
        Self {
            store,
            chain,
            whitelist,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cells(&self) -> std::sync::MutexGuard<'_, HashMap<CellKey, Cell>> {
        self.cells.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Judge one observed offense for (module, ip)
    ///
    /// Counts recent offenses inside the module window and jails on the
    /// local threshold; otherwise consults the cached HQ verdict when the
    /// module opted in.
    pub fn observe(&self, module: &Module, ip: Ipv4Addr) -> CrateResult<Verdict> {
        if ip == SENTINEL_IP || module.whitelist.contains(ip) || self.whitelist.contains(ip) {
            return Ok(Verdict::Ignored);
        }

        let mut cells = self.lock_cells();
        {
            let cell = cells
                .entry((module.name.clone(), ip))
                .or_insert_with(Cell::new);
            cell.touch();
            cell.observe();
        }

        let since = clock::minus_seconds(module.window_seconds);
        let count = self
            .store
            .offense_count_since(&module.name, &ip.to_string(), &since)?;

        if count >= module.jail_attempt {
            return self.jail_cell(&mut cells, &module.name, ip, module.jail_duration);
        }

        if let Some(policy) = &module.intc_hq
            && policy.active
            && let Some(verdict) = self.store.hq_info(&ip.to_string())?
            && (verdict.ab_score >= policy.jail_abuseipdb_score
                || verdict.total_reports >= policy.jail_total_reports)
        {
            debug!(
                module = %module.name,
                %ip,
                ab_score = verdict.ab_score,
                total_reports = verdict.total_reports,
                "jailing on HQ reputation"
            );
            return self.jail_cell(&mut cells, &module.name, ip, policy.jail_duration);
        }

        Ok(Verdict::Observing)
    }

    /// Jail an address directly, outside of an observation
    pub fn jail(&self, module_name: &str, ip: Ipv4Addr, duration: i64) -> CrateResult<Verdict> {
        if ip == SENTINEL_IP || self.whitelist.contains(ip) {
            return Ok(Verdict::Ignored);
        }
        let mut cells = self.lock_cells();
        self.jail_cell(&mut cells, module_name, ip, duration)
    }

    fn jail_cell(
        &self,
        cells: &mut HashMap<CellKey, Cell>,
        module_name: &str,
        ip: Ipv4Addr,
        duration: i64,
    ) -> CrateResult<Verdict> {
        let ip_text = ip.to_string();

        if self.store.jail_for_ip(&ip_text)?.is_some() {
            // Row already present; make sure the rule is too. A failed add
            // is picked up by the next reconcile pass.
            match self.chain.exists(ip) {
                Ok(false) => {
                    if let Err(e) = self.chain.add(ip) {
                        warn!(ip = %ip_text, error = %e, "rule re-install failed");
                    }
                }
                Ok(true) => {}
                Err(e) => warn!(ip = %ip_text, error = %e, "rule check failed"),
            }
            self.mark_jailed(cells, module_name, ip);
            return Ok(Verdict::AlreadyJailed);
        }

        match self.chain.exists(ip) {
            Ok(true) => {
                self.mark_jailed(cells, module_name, ip);
                return Ok(Verdict::AlreadyJailed);
            }
            Ok(false) => {}
            Err(e) => warn!(ip = %ip_text, error = %e, "rule check failed"),
        }

        if let Err(e) = self.chain.add(ip) {
            // The row below is still written; reconcile retries the rule
            warn!(ip = %ip_text, error = %e, "firewall add failed");
        }

        self.store.record_jail(&clock::sdatetime(), module_name, &ip_text, duration)?;
        self.store
            .record_jail_log(&clock::sdatetime(), module_name, &ip_text, duration)?;
        self.mark_jailed(cells, module_name, ip);

        info!(
            module = %module_name,
            ip = %ip_text,
            duration,
            release_at = clock::unix_time() + duration,
            "jailed"
        );
        Ok(Verdict::Jailed)
    }

    fn mark_jailed(&self, cells: &mut HashMap<CellKey, Cell>, module_name: &str, ip: Ipv4Addr) {
        let cell = cells
            .entry((module_name.to_string(), ip))
            .or_insert_with(Cell::new);
        cell.touch();
        cell.jail();
    }

    /// Release every jail whose duration has elapsed, returning how many
    pub fn release_expired(&self) -> CrateResult<usize> {
        let mut cells = self.lock_cells();
        let now = clock::now();
        let mut released = 0;

        for row in self.store.active_jails()? {
            let expired = match clock::parse(&row.created_on) {
                Ok(created) => now > clock::plus_seconds(created, row.duration),
                Err(e) => {
                    warn!(ip = %row.ip_address, error = %e, "unreadable jail row, releasing");
                    true
                }
            };
            if !expired {
                continue;
            }

            if let Ok(ip) = row.ip_address.parse::<Ipv4Addr>() {
                if let Err(e) = self.chain.remove(ip) {
                    warn!(ip = %row.ip_address, error = %e, "firewall remove failed");
                }
                if let Some(mut cell) = cells.remove(&(row.module_name.clone(), ip)) {
                    cell.expire();
                }
            }
            self.store.remove_jail(&row.ip_address)?;
            info!(module = %row.module_name, ip = %row.ip_address, "released from jail");
            released += 1;
        }

        // Forget quiet cells that never reached a jail
        let horizon = now - chrono::Duration::seconds(CELL_IDLE_SECS);
        cells.retain(|_, cell| cell.is_jailed() || cell.last_seen > horizon);

        Ok(released)
    }

    /// Make the chain equal to the jail table
    ///
    /// Re-installs rules lost to runtime firewall failures and removes
    /// rules nothing in the table accounts for.
    pub fn reconcile(&self) -> CrateResult<()> {
        let _cells = self.lock_cells();

        let wanted: HashSet<Ipv4Addr> = self
            .store
            .active_jails()?
            .into_iter()
            .filter_map(|row| row.ip_address.parse().ok())
            .collect();
        let present: HashSet<Ipv4Addr> = self.chain.entries()?.into_iter().collect();

        for ip in wanted.difference(&present) {
            warn!(%ip, "re-installing missing jail rule");
            if let Err(e) = self.chain.add(*ip) {
                warn!(%ip, error = %e, "rule re-install failed");
            }
        }
        for ip in present.difference(&wanted) {
            warn!(%ip, "removing orphaned jail rule");
            if let Err(e) = self.chain.remove(*ip) {
                warn!(%ip, error = %e, "orphan removal failed");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryChain;
    use crate::registry::{HqPolicy, LogSource};

    fn test_module(name: &str, attempt: u32, whitelist: &[&str]) -> Module {
        Module {
            name: name.to_string(),
            source: LogSource::Journal,
            rules: Vec::new(),
            jail_attempt: attempt,
            jail_duration: 120,
            window_seconds: 60,
            whitelist: Whitelist::parse(
                &whitelist.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
            .unwrap(),
            intc_hq: None,
        }
    }

    fn fixture() -> (tempfile::TempDir, Arc<Store>, Arc<MemoryChain>, Warden) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("software.db")).unwrap());
        let chain = Arc::new(MemoryChain::new());
        let warden = Warden::new(
            Arc::clone(&store),
            Arc::clone(&chain) as Arc<dyn Chain>,
            Whitelist::default(),
        );
        (dir, store, chain, warden)
    }

    fn seed_offense(store: &Store, module: &str, ip: &str) {
        store
            .record_offense(&clock::sdatetime(), "18", "line", module, ip, "kw", "")
            .unwrap();
    }

    #[test]
    fn test_jail_on_third_offense() {
        let (_dir, store, chain, warden) = fixture();
        let module = test_module("sshd", 3, &[]);
        let ip: Ipv4Addr = "203.0.113.5".parse().unwrap();

        for expected in [Verdict::Observing, Verdict::Observing, Verdict::Jailed] {
            seed_offense(&store, "sshd", "203.0.113.5");
            assert_eq!(warden.observe(&module, ip).unwrap(), expected);
        }

        assert_eq!(chain.entries().unwrap(), vec![ip]);
        assert!(store.jail_for_ip("203.0.113.5").unwrap().is_some());
        assert_eq!(store.jail_history().unwrap().len(), 1);

        // Further offenses do not install a second rule
        seed_offense(&store, "sshd", "203.0.113.5");
        assert_eq!(warden.observe(&module, ip).unwrap(), Verdict::AlreadyJailed);
        assert_eq!(chain.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_window_only_counts_same_module() {
        let (_dir, store, _chain, warden) = fixture();
        let module = test_module("sshd", 3, &[]);
        let ip: Ipv4Addr = "203.0.113.5".parse().unwrap();

        // Offenses from another module never count toward sshd's window
        for _ in 0..5 {
            seed_offense(&store, "dovecot", "203.0.113.5");
        }
        seed_offense(&store, "sshd", "203.0.113.5");
        assert_eq!(warden.observe(&module, ip).unwrap(), Verdict::Observing);
    }

    #[test]
    fn test_whitelisted_is_ignored() {
        let (_dir, store, chain, warden) = fixture();
        let module = test_module("sshd", 1, &["10.0.0.1"]);
        let ip: Ipv4Addr = "10.0.0.1".parse().unwrap();

        for _ in 0..10 {
            seed_offense(&store, "sshd", "10.0.0.1");
            assert_eq!(warden.observe(&module, ip).unwrap(), Verdict::Ignored);
        }
        assert!(chain.entries().unwrap().is_empty());
        assert!(store.jail_for_ip("10.0.0.1").unwrap().is_none());
    }

    #[test]
    fn test_global_whitelist_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("software.db")).unwrap());
        let chain = Arc::new(MemoryChain::new());
        let warden = Warden::new(
            Arc::clone(&store),
            Arc::clone(&chain) as Arc<dyn Chain>,
            Whitelist::parse(&["192.168.0.0/16".to_string()]).unwrap(),
        );
        let module = test_module("sshd", 1, &[]);

        seed_offense(&store, "sshd", "192.168.1.20");
        assert_eq!(
            warden.observe(&module, "192.168.1.20".parse().unwrap()).unwrap(),
            Verdict::Ignored
        );
        assert!(chain.entries().unwrap().is_empty());
    }

    #[test]
    fn test_sentinel_is_ignored() {
        let (_dir, store, chain, warden) = fixture();
        let module = test_module("sshd", 1, &[]);

        seed_offense(&store, "sshd", "0.0.0.0");
        assert_eq!(
            warden.observe(&module, SENTINEL_IP).unwrap(),
            Verdict::Ignored
        );
        assert!(chain.entries().unwrap().is_empty());
    }

    #[test]
    fn test_hq_reputation_jails_below_local_threshold() {
        let (_dir, store, chain, warden) = fixture();
        let mut module = test_module("sshd", 4, &[]);
        module.intc_hq = Some(HqPolicy {
            active: true,
            report: true,
            jail_total_reports: 10,
            jail_abuseipdb_score: 90,
            jail_duration: 600,
        });
        let ip: Ipv4Addr = "192.0.2.7".parse().unwrap();

        store.upsert_hq_info("192.0.2.7", 95, 2).unwrap();
        seed_offense(&store, "sshd", "192.0.2.7");

        assert_eq!(warden.observe(&module, ip).unwrap(), Verdict::Jailed);
        assert_eq!(chain.entries().unwrap(), vec![ip]);
        // Reputation jails use the policy duration
        assert_eq!(store.jail_for_ip("192.0.2.7").unwrap().unwrap().duration, 600);
    }

    #[test]
    fn test_inactive_hq_policy_not_consulted() {
        let (_dir, store, chain, warden) = fixture();
        let mut module = test_module("sshd", 4, &[]);
        module.intc_hq = Some(HqPolicy {
            active: false,
            report: true,
            jail_total_reports: 10,
            jail_abuseipdb_score: 90,
            jail_duration: 600,
        });

        store.upsert_hq_info("192.0.2.7", 95, 20).unwrap();
        seed_offense(&store, "sshd", "192.0.2.7");

        assert_eq!(
            warden.observe(&module, "192.0.2.7".parse().unwrap()).unwrap(),
            Verdict::Observing
        );
        assert!(chain.entries().unwrap().is_empty());
    }

    #[test]
    fn test_direct_jail_is_idempotent() {
        let (_dir, store, chain, warden) = fixture();
        let ip: Ipv4Addr = "203.0.113.5".parse().unwrap();

        assert_eq!(warden.jail("sshd", ip, 120).unwrap(), Verdict::Jailed);
        assert_eq!(warden.jail("sshd", ip, 120).unwrap(), Verdict::AlreadyJailed);

        assert_eq!(chain.entries().unwrap().len(), 1);
        assert_eq!(store.active_jails().unwrap().len(), 1);
        assert_eq!(store.jail_history().unwrap().len(), 1);
    }

    #[test]
    fn test_release_on_expiry() {
        let (_dir, store, chain, warden) = fixture();
        let ip: Ipv4Addr = "198.51.100.9".parse().unwrap();

        // Jailed 130 seconds ago with a 120 second sentence
        let created = clock::format(clock::plus_seconds(clock::now(), -130));
        store.record_jail(&created, "sshd", "198.51.100.9", 120).unwrap();
        store
            .record_jail_log(&created, "sshd", "198.51.100.9", 120)
            .unwrap();
        chain.add(ip).unwrap();

        assert_eq!(warden.release_expired().unwrap(), 1);
        assert!(store.jail_for_ip("198.51.100.9").unwrap().is_none());
        assert!(chain.entries().unwrap().is_empty());
        // History survives the release
        assert_eq!(store.jail_history().unwrap().len(), 1);
    }

    #[test]
    fn test_unexpired_jail_not_released() {
        let (_dir, store, chain, warden) = fixture();
        let ip: Ipv4Addr = "198.51.100.9".parse().unwrap();

        store
            .record_jail(&clock::sdatetime(), "sshd", "198.51.100.9", 120)
            .unwrap();
        chain.add(ip).unwrap();

        assert_eq!(warden.release_expired().unwrap(), 0);
        assert!(store.jail_for_ip("198.51.100.9").unwrap().is_some());
        assert_eq!(chain.entries().unwrap(), vec![ip]);
    }

    #[test]
    fn test_reconcile_restores_and_prunes_rules() {
        let (_dir, store, chain, warden) = fixture();

        // Row without a rule: the add failed at jail time
        store
            .record_jail(&clock::sdatetime(), "sshd", "203.0.113.5", 120)
            .unwrap();
        // Rule without a row: left behind by something else
        chain.add("198.51.100.9".parse().unwrap()).unwrap();

        warden.reconcile().unwrap();

        let entries = chain.entries().unwrap();
        assert_eq!(entries, vec!["203.0.113.5".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_cell_machine_lifecycle() {
        let mut cell = Cell::new();
        assert_eq!(cell.machine.current_state(), "Unseen");

        cell.observe();
        assert_eq!(cell.machine.current_state(), "Observing");

        cell.jail();
        assert!(cell.is_jailed());

        cell.expire();
        assert_eq!(cell.machine.current_state(), "Unseen");
    }
}
