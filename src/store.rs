//! Embedded relational store
//!
//! One SQLite file, one connection, one mutex. Every public operation
//! locks, runs and unlocks; callers compose larger critical sections with
//! their own locks. Schema is created at startup, there are no migrations.

use crate::clock;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, named_params};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    createdOn TEXT,
    intrusion_service_id TEXT,
    intrusion_detail TEXT,
    module_name TEXT,
    ip_address TEXT,
    keyword TEXT,
    user TEXT
);
CREATE TABLE IF NOT EXISTS iptables (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    createdOn TEXT,
    module_name TEXT,
    ip_address TEXT UNIQUE,
    duration INTEGER
);
CREATE TABLE IF NOT EXISTS iptables_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    createdOn TEXT,
    module_name TEXT,
    ip_address TEXT,
    duration INTEGER
);
CREATE TABLE IF NOT EXISTS hq_information (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    createdOn TEXT,
    updatedOn TEXT,
    ip_address TEXT UNIQUE,
    ab_score INTEGER,
    hq_totalReports INTEGER
);
CREATE TABLE IF NOT EXISTS hq_information_to_report (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    createdOn TEXT,
    id_log INTEGER
);
";

/// An active jail row from the `iptables` table
#[derive(Debug, Clone)]
pub struct JailRow {
    pub created_on: String,
    pub module_name: String,
    pub ip_address: String,
    pub duration: i64,
}

/// One recorded offense from the `logs` table
#[derive(Debug, Clone)]
pub struct OffenseRow {
    pub id: i64,
    pub created_on: String,
    pub service_id: String,
    pub detail: String,
    pub module_name: String,
    pub ip_address: String,
    pub keyword: String,
    pub user: String,
}

/// A queued HQ report from the `hq_information_to_report` table
#[derive(Debug, Clone, Copy)]
pub struct PendingRow {
    pub id: i64,
    pub id_log: i64,
}

/// Cached HQ verdict for one address
#[derive(Debug, Clone, Copy)]
pub struct HqInfoRow {
    pub ab_score: i64,
    pub total_reports: i64,
}

/// Embedded store handle, shared across workers
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store file and bootstrap the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::StoreUnavailable(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            Error::StoreUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // connection is still sound for SQLite.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert an offense, returning its row id when the insert took
    pub fn record_offense(
        &self,
        created_on: &str,
        service_id: &str,
        detail: &str,
        module_name: &str,
        ip: &str,
        keyword: &str,
        user: &str,
    ) -> Result<Option<i64>> {
        let conn = self.lock();
        let affected = conn.execute(
            "INSERT INTO logs (createdOn, intrusion_service_id, intrusion_detail, module_name, ip_address, keyword, user)
             VALUES (:datetime, :service_id, :detail, :module, :ip, :keyword, :user)",
            named_params! {
                ":datetime": created_on,
                ":service_id": service_id,
                ":detail": detail,
                ":module": module_name,
                ":ip": ip,
                ":keyword": keyword,
                ":user": user,
            },
        )?;

        if affected == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Queue an offense for HQ delivery
    pub fn enqueue_report(&self, id_log: i64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO hq_information_to_report (createdOn, id_log) VALUES (:datetime, :id_log)",
            named_params! { ":datetime": clock::sdatetime(), ":id_log": id_log },
        )?;
        Ok(())
    }

    /// Offenses for (module, ip) created at or after `since`
    pub fn offense_count_since(&self, module_name: &str, ip: &str, since: &str) -> Result<u32> {
        let count: u32 = self.lock().query_row(
            "SELECT COUNT(*) FROM logs
             WHERE module_name = :module AND ip_address = :ip AND createdOn >= :since",
            named_params! { ":module": module_name, ":ip": ip, ":since": since },
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total offenses created at or after `since`, across all modules
    pub fn offense_count_recent(&self, since: &str) -> Result<i64> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM logs WHERE createdOn >= :since",
            named_params! { ":since": since },
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Load one offense by id
    pub fn offense_by_id(&self, id: i64) -> Result<Option<OffenseRow>> {
        let row = self
            .lock()
            .query_row(
                "SELECT id, createdOn, intrusion_service_id, intrusion_detail, module_name, ip_address, keyword, user
                 FROM logs WHERE id = :id",
                named_params! { ":id": id },
                |row| {
                    Ok(OffenseRow {
                        id: row.get(0)?,
                        created_on: row.get(1)?,
                        service_id: row.get(2)?,
                        detail: row.get(3)?,
                        module_name: row.get(4)?,
                        ip_address: row.get(5)?,
                        keyword: row.get(6)?,
                        user: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a jail row; the ip column is unique
    pub fn record_jail(
        &self,
        created_on: &str,
        module_name: &str,
        ip: &str,
        duration: i64,
    ) -> Result<()> {
        self.lock().execute(
            "INSERT INTO iptables (createdOn, module_name, ip_address, duration)
             VALUES (:datetime, :module, :ip, :duration)",
            named_params! {
                ":datetime": created_on,
                ":module": module_name,
                ":ip": ip,
                ":duration": duration,
            },
        )?;
        Ok(())
    }

    /// Append to the permanent jail history
    pub fn record_jail_log(
        &self,
        created_on: &str,
        module_name: &str,
        ip: &str,
        duration: i64,
    ) -> Result<()> {
        self.lock().execute(
            "INSERT INTO iptables_logs (createdOn, module_name, ip_address, duration)
             VALUES (:datetime, :module, :ip, :duration)",
            named_params! {
                ":datetime": created_on,
                ":module": module_name,
                ":ip": ip,
                ":duration": duration,
            },
        )?;
        Ok(())
    }

    /// Remove an active jail row
    pub fn remove_jail(&self, ip: &str) -> Result<usize> {
        let affected = self.lock().execute(
            "DELETE FROM iptables WHERE ip_address = :ip",
            named_params! { ":ip": ip },
        )?;
        Ok(affected)
    }

    /// Remove every active jail row
    pub fn clear_jails(&self) -> Result<usize> {
        let affected = self.lock().execute("DELETE FROM iptables", [])?;
        Ok(affected)
    }

    /// The active jail row for an ip, when present
    pub fn jail_for_ip(&self, ip: &str) -> Result<Option<JailRow>> {
        let row = self
            .lock()
            .query_row(
                "SELECT createdOn, module_name, ip_address, duration FROM iptables WHERE ip_address = :ip",
                named_params! { ":ip": ip },
                |row| {
                    Ok(JailRow {
                        created_on: row.get(0)?,
                        module_name: row.get(1)?,
                        ip_address: row.get(2)?,
                        duration: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All active jail rows
    pub fn active_jails(&self) -> Result<Vec<JailRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT createdOn, module_name, ip_address, duration FROM iptables ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(JailRow {
                    created_on: row.get(0)?,
                    module_name: row.get(1)?,
                    ip_address: row.get(2)?,
                    duration: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Entire jail history
    pub fn jail_history(&self) -> Result<Vec<JailRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT createdOn, module_name, ip_address, duration FROM iptables_logs ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(JailRow {
                    created_on: row.get(0)?,
                    module_name: row.get(1)?,
                    ip_address: row.get(2)?,
                    duration: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Queued HQ reports, oldest first
    pub fn pending_reports(&self) -> Result<Vec<PendingRow>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, id_log FROM hq_information_to_report ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PendingRow {
                    id: row.get(0)?,
                    id_log: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Dequeue one report
    pub fn remove_pending_report(&self, id: i64) -> Result<()> {
        self.lock().execute(
            "DELETE FROM hq_information_to_report WHERE id = :id",
            named_params! { ":id": id },
        )?;
        Ok(())
    }

    /// Count of queued reports
    pub fn pending_report_count(&self) -> Result<i64> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM hq_information_to_report",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop queued reports whose offense no longer exists
    pub fn prune_dangling_reports(&self) -> Result<usize> {
        let affected = self.lock().execute(
            "DELETE FROM hq_information_to_report
             WHERE id_log NOT IN (SELECT id FROM logs)",
            [],
        )?;
        Ok(affected)
    }

    /// Delete every offense for one ip
    pub fn prune_offenses_for_ip(&self, ip: &str) -> Result<usize> {
        let affected = self.lock().execute(
            "DELETE FROM logs WHERE ip_address = :ip",
            named_params! { ":ip": ip },
        )?;
        Ok(affected)
    }

    /// Delete offenses created at or before `cutoff`
    pub fn prune_offenses_before(&self, cutoff: &str) -> Result<usize> {
        let affected = self.lock().execute(
            "DELETE FROM logs WHERE createdOn <= :cutoff",
            named_params! { ":cutoff": cutoff },
        )?;
        Ok(affected)
    }

    /// Distinct addresses currently present in the offense table
    pub fn distinct_offense_ips(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT ip_address FROM logs")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct addresses with a cached HQ verdict
    pub fn distinct_hq_ips(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT ip_address FROM hq_information")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or refresh the cached HQ verdict for an ip
    pub fn upsert_hq_info(&self, ip: &str, ab_score: i64, total_reports: i64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO hq_information (createdOn, updatedOn, ip_address, ab_score, hq_totalReports)
             VALUES (:datetime, :datetime, :ip, :ab_score, :total)
             ON CONFLICT(ip_address) DO UPDATE SET
                 updatedOn = :datetime, ab_score = :ab_score, hq_totalReports = :total",
            named_params! {
                ":datetime": clock::sdatetime(),
                ":ip": ip,
                ":ab_score": ab_score,
                ":total": total_reports,
            },
        )?;
        Ok(())
    }

    /// Cached HQ verdict for an ip, when present
    pub fn hq_info(&self, ip: &str) -> Result<Option<HqInfoRow>> {
        let row = self
            .lock()
            .query_row(
                "SELECT ab_score, hq_totalReports FROM hq_information WHERE ip_address = :ip",
                named_params! { ":ip": ip },
                |row| {
                    Ok(HqInfoRow {
                        ab_score: row.get(0)?,
                        total_reports: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Drop the cached HQ verdict for an ip
    pub fn remove_hq_info(&self, ip: &str) -> Result<usize> {
        let affected = self.lock().execute(
            "DELETE FROM hq_information WHERE ip_address = :ip",
            named_params! { ":ip": ip },
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("software.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("db/software.db");
        Store::open(&nested).unwrap();
        assert!(nested.exists());
    }

    fn offense(store: &Store, module: &str, ip: &str) -> Option<i64> {
        store
            .record_offense(&clock::sdatetime(), "100", "line", module, ip, "kw", "")
            .unwrap()
    }

    #[test]
    fn test_record_offense_returns_id() {
        let (_dir, store) = temp_store();
        let id = store
            .record_offense(
                &clock::sdatetime(),
                "100",
                "raw line",
                "sshd",
                "203.0.113.5",
                "Failed password",
                "root",
            )
            .unwrap();
        assert_eq!(id, Some(1));

        let offense = store.offense_by_id(1).unwrap().unwrap();
        assert_eq!(offense.module_name, "sshd");
        assert_eq!(offense.ip_address, "203.0.113.5");
        assert_eq!(offense.user, "root");
    }

    #[test]
    fn test_offense_window_count() {
        let (_dir, store) = temp_store();
        for _ in 0..3 {
            offense(&store, "sshd", "203.0.113.5");
        }
        offense(&store, "dovecot", "203.0.113.5");

        let since = clock::minus_seconds(60);
        assert_eq!(
            store.offense_count_since("sshd", "203.0.113.5", &since).unwrap(),
            3
        );
        // A window that starts in the future sees nothing
        let future = clock::format(clock::plus_seconds(clock::now(), 60));
        assert_eq!(
            store.offense_count_since("sshd", "203.0.113.5", &future).unwrap(),
            0
        );
    }

    #[test]
    fn test_jail_rows() {
        let (_dir, store) = temp_store();
        let now = clock::sdatetime();
        store.record_jail(&now, "sshd", "198.51.100.9", 120).unwrap();
        store.record_jail_log(&now, "sshd", "198.51.100.9", 120).unwrap();

        assert!(store.jail_for_ip("198.51.100.9").unwrap().is_some());
        assert_eq!(store.active_jails().unwrap().len(), 1);

        assert_eq!(store.remove_jail("198.51.100.9").unwrap(), 1);
        assert!(store.jail_for_ip("198.51.100.9").unwrap().is_none());
        // History is never pruned
        assert_eq!(store.jail_history().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_jail_rejected() {
        let (_dir, store) = temp_store();
        let now = clock::sdatetime();
        store.record_jail(&now, "sshd", "198.51.100.9", 120).unwrap();
        assert!(store.record_jail(&now, "dovecot", "198.51.100.9", 600).is_err());
    }

    #[test]
    fn test_pending_report_lifecycle() {
        let (_dir, store) = temp_store();
        let id = offense(&store, "sshd", "203.0.113.5").unwrap();
        store.enqueue_report(id).unwrap();

        let pending = store.pending_reports().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id_log, id);

        store.remove_pending_report(pending[0].id).unwrap();
        assert_eq!(store.pending_report_count().unwrap(), 0);
    }

    #[test]
    fn test_dangling_reports_pruned() {
        let (_dir, store) = temp_store();
        let id = offense(&store, "sshd", "203.0.113.5").unwrap();
        store.enqueue_report(id).unwrap();
        store.prune_offenses_for_ip("203.0.113.5").unwrap();

        assert_eq!(store.prune_dangling_reports().unwrap(), 1);
        assert_eq!(store.pending_report_count().unwrap(), 0);
    }

    #[test]
    fn test_prune_before_cutoff() {
        let (_dir, store) = temp_store();
        offense(&store, "sshd", "203.0.113.5");

        // Nothing is older than 24h yet
        assert_eq!(store.prune_offenses_before(&clock::minus_hours(24)).unwrap(), 0);
        // Everything is older than a future cutoff
        let future = clock::format(clock::plus_seconds(clock::now(), 60));
        assert_eq!(store.prune_offenses_before(&future).unwrap(), 1);
    }

    #[test]
    fn test_hq_info_upsert() {
        let (_dir, store) = temp_store();
        store.upsert_hq_info("192.0.2.7", 95, 2).unwrap();
        store.upsert_hq_info("192.0.2.7", 97, 5).unwrap();

        let info = store.hq_info("192.0.2.7").unwrap().unwrap();
        assert_eq!(info.ab_score, 97);
        assert_eq!(info.total_reports, 5);
        assert_eq!(store.distinct_hq_ips().unwrap().len(), 1);

        assert_eq!(store.remove_hq_info("192.0.2.7").unwrap(), 1);
        assert!(store.hq_info("192.0.2.7").unwrap().is_none());
    }
}
