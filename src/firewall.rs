//! Firewall gateway
//!
//! Owns one iptables chain and every rule in it. The daemon installs
//! REJECT rules for jailed addresses and removes them on release; on a
//! clean shutdown the chain is flushed, unlinked from INPUT and deleted.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::{debug, warn};

/// The rule operations the jail manager needs from a firewall chain
///
/// `Iptables` is the production implementation; tests substitute an
/// in-memory one.
pub trait Chain: Send + Sync {
    fn add(&self, ip: Ipv4Addr) -> Result<()>;
    fn remove(&self, ip: Ipv4Addr) -> Result<()>;
    fn exists(&self, ip: Ipv4Addr) -> Result<bool>;
    fn entries(&self) -> Result<Vec<Ipv4Addr>>;
}

/// iptables-backed chain manager
pub struct Iptables {
    binary: PathBuf,
    chain: String,
}

impl Iptables {
    pub fn new(binary: impl Into<PathBuf>, chain: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            chain: chain.into(),
        }
    }

    /// True when configured to operate on INPUT directly, without an
    /// owned chain
    fn manages_input(&self) -> bool {
        self.chain == "INPUT"
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary).args(args).output().map_err(|e| {
            Error::FirewallUnavailable(format!(
                "failed to run {} {}: {}",
                self.binary.display(),
                args.join(" "),
                e
            ))
        })
    }

    /// Run a rule operation, reporting only whether it succeeded
    fn run_status(&self, args: &[&str]) -> Result<bool> {
        Ok(self.output(args)?.status.success())
    }

    /// Run a chain operation that must succeed
    fn run_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::FirewallUnavailable(format!(
                "iptables {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Count `INPUT -j <chain>` links and delete that many
    fn unlink_all(&self) -> Result<usize> {
        if self.manages_input() {
            return Ok(0);
        }

        let listing = self.output(&["-S", "INPUT"])?;
        let text = String::from_utf8_lossy(&listing.stdout);
        let link = format!("-A INPUT -j {}", self.chain);
        let count = text.lines().filter(|l| l.trim() == link).count();

        for _ in 0..count {
            self.run_ok(&["-D", "INPUT", "-j", &self.chain])?;
        }
        Ok(count)
    }

    /// Create the chain and link it once from INPUT
    ///
    /// Stale links and a leftover chain from an unclean shutdown are
    /// cleaned up first.
    pub fn init(&self) -> Result<()> {
        let stale = self.unlink_all()?;
        if stale > 0 {
            warn!(chain = %self.chain, links = stale, "removed stale INPUT links");
        }

        if self.manages_input() {
            debug!("operating directly on INPUT, no chain created");
            return Ok(());
        }

        // A leftover chain makes -N fail; flushing and deleting a chain
        // that does not exist is a tolerated no-op.
        let _ = self.run_status(&["-F", &self.chain]);
        let _ = self.run_status(&["-X", &self.chain]);

        self.run_ok(&["-N", &self.chain])?;
        self.run_ok(&["-A", "INPUT", "-j", &self.chain])?;
        debug!(chain = %self.chain, "chain created and linked");
        Ok(())
    }

    /// Flush the chain, unlink it from INPUT and delete it
    pub fn reset(&self) -> Result<()> {
        self.run_ok(&["-F", &self.chain])?;
        if !self.manages_input() {
            self.unlink_all()?;
            self.run_ok(&["-X", &self.chain])?;
        }
        Ok(())
    }
}

/// Parse the source addresses of REJECT rules out of `iptables -S <chain>`
fn parse_entries(chain: &str, listing: &str) -> Vec<Ipv4Addr> {
    let prefix = format!("-A {} -s ", chain);
    listing
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix(&prefix)?;
            if !rest.ends_with("-j REJECT") {
                return None;
            }
            let source = rest.split_whitespace().next()?;
            let addr = source.split('/').next()?;
            addr.parse().ok()
        })
        .collect()
}

impl Chain for Iptables {
    fn add(&self, ip: Ipv4Addr) -> Result<()> {
        if self.exists(ip)? {
            return Ok(());
        }
        let ip = ip.to_string();
        self.run_ok(&["-A", &self.chain, "-s", &ip, "-j", "REJECT"])
    }

    fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        let ip = ip.to_string();
        // A missing rule is an idempotent no-op
        if !self.run_status(&["-D", &self.chain, "-s", &ip, "-j", "REJECT"])? {
            debug!(%ip, chain = %self.chain, "rule already absent");
        }
        Ok(())
    }

    fn exists(&self, ip: Ipv4Addr) -> Result<bool> {
        let ip = ip.to_string();
        self.run_status(&["-C", &self.chain, "-s", &ip, "-j", "REJECT"])
    }

    fn entries(&self) -> Result<Vec<Ipv4Addr>> {
        let output = self.output(&["-S", &self.chain])?;
        Ok(parse_entries(
            &self.chain,
            &String::from_utf8_lossy(&output.stdout),
        ))
    }
}

/// In-memory chain for tests
#[cfg(test)]
pub struct MemoryChain {
    rules: std::sync::Mutex<Vec<Ipv4Addr>>,
}

#[cfg(test)]
impl MemoryChain {
    pub fn new() -> Self {
        Self {
            rules: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl Chain for MemoryChain {
    fn add(&self, ip: Ipv4Addr) -> Result<()> {
        // Appends unconditionally, like the real tool: idempotence is the
        // caller's contract under test
        self.rules.lock().unwrap().push(ip);
        Ok(())
    }

    fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        if let Some(pos) = rules.iter().position(|r| *r == ip) {
            rules.remove(pos);
        }
        Ok(())
    }

    fn exists(&self, ip: Ipv4Addr) -> Result<bool> {
        Ok(self.rules.lock().unwrap().contains(&ip))
    }

    fn entries(&self) -> Result<Vec<Ipv4Addr>> {
        Ok(self.rules.lock().unwrap().clone())
    }
}
