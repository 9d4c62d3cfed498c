//! Module registry
//!
//! Loads declarative module descriptors (one JSON file per watched
//! service) and compiles their rules into reusable matchers. Invalid
//! descriptors are logged and skipped; patterns are compiled exactly once.

use crate::config::Config;
use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Where a module's log lines come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// The shared system journal stream
    Journal,
    /// A dedicated log file
    File(PathBuf),
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Journal => write!(f, "journal"),
            LogSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Addresses that must never be jailed
///
/// Entries are bare IPv4 addresses or CIDR blocks.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    nets: Vec<Ipv4Net>,
}

impl Whitelist {
    /// Parse whitelist entries; a bare address becomes a /32
    pub fn parse(entries: &[String]) -> std::result::Result<Self, String> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let net = if let Ok(addr) = entry.parse::<Ipv4Addr>() {
                Ipv4Net::new(addr, 32).map_err(|e| format!("'{}': {}", entry, e))?
            } else {
                entry
                    .parse::<Ipv4Net>()
                    .map_err(|_| format!("'{}' is not an IPv4 address or CIDR block", entry))?
            };
            nets.push(net);
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Merge another whitelist into this one
    pub fn extend(&mut self, other: &Whitelist) {
        self.nets.extend(other.nets.iter().copied());
    }
}

/// How a rule locates the offending address on a line
#[derive(Debug, Clone)]
enum Detection {
    /// The descriptor named a fixed address
    Literal(Ipv4Addr),
    /// Extract from the line; capture group 1 when present, else the
    /// whole match
    Pattern(Regex),
}

/// One compiled intrusion pattern
#[derive(Debug, Clone)]
pub struct Rule {
    /// Opaque service identifier forwarded to HQ
    pub service_id: String,
    /// Pattern source, recorded with each offense
    pub keyword: String,
    matcher: Regex,
    detection: Detection,
    user: Option<Regex>,
}

impl Rule {
    pub fn matches(&self, line: &str) -> bool {
        self.matcher.is_match(line)
    }

    /// The offending address, when the line yields a syntactically valid
    /// IPv4
    pub fn extract_ip(&self, line: &str) -> Option<Ipv4Addr> {
        match &self.detection {
            Detection::Literal(addr) => Some(*addr),
            Detection::Pattern(re) => {
                let caps = re.captures(line)?;
                let text = caps.get(1).or_else(|| caps.get(0))?.as_str();
                text.parse().ok()
            }
        }
    }

    /// The user named on the line, when the rule extracts one
    pub fn extract_user(&self, line: &str) -> Option<String> {
        let re = self.user.as_ref()?;
        let caps = re.captures(line)?;
        let text = caps.get(1).or_else(|| caps.get(0))?.as_str();
        Some(text.to_string())
    }
}

/// Per-module HQ reputation policy
#[derive(Debug, Clone)]
pub struct HqPolicy {
    /// Consult the cached HQ verdict in jail decisions
    pub active: bool,
    /// Queue this module's offenses for HQ delivery
    pub report: bool,
    /// Jail when HQ has seen at least this many reports
    pub jail_total_reports: i64,
    /// Jail when the reputation score reaches this value
    pub jail_abuseipdb_score: i64,
    /// Jail duration for reputation-driven jails
    pub jail_duration: i64,
}

/// A named ruleset for one watched service, immutable after load
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub source: LogSource,
    pub rules: Vec<Rule>,
    /// Offenses within the window before a jail
    pub jail_attempt: u32,
    /// Jail duration in seconds
    pub jail_duration: i64,
    /// Sliding-window length for the offense count
    pub window_seconds: i64,
    pub whitelist: Whitelist,
    pub intc_hq: Option<HqPolicy>,
}

impl Module {
    /// Whether offenses from this module are queued for HQ
    pub fn reports_to_hq(&self) -> bool {
        self.intc_hq.as_ref().map(|p| p.report).unwrap_or(true)
    }
}

// Descriptor shapes as written on disk

#[derive(Debug, Deserialize)]
struct ModuleFile {
    module_name: String,
    source_log: Option<PathBuf>,
    jail_attempt: Option<u32>,
    jail_duration: Option<i64>,
    window_seconds: Option<i64>,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(rename = "intcHQ")]
    intc_hq: Option<HqPolicyFile>,
    rules: Vec<RuleFile>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    service_id: String,
    keyword: String,
    detection: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HqPolicyFile {
    #[serde(default)]
    active: bool,
    #[serde(default = "default_hq_report")]
    report: bool,
    #[serde(rename = "jail_totalReports", default = "default_hq_jail_total_reports")]
    jail_total_reports: i64,
    #[serde(default = "default_hq_jail_score")]
    jail_abuseipdb_score: i64,
    #[serde(default = "default_hq_jail_duration")]
    jail_duration: i64,
}

fn default_hq_report() -> bool {
    true
}

fn default_hq_jail_total_reports() -> i64 {
    10
}

fn default_hq_jail_score() -> i64 {
    100
}

fn default_hq_jail_duration() -> i64 {
    600
}

/// All loaded modules
#[derive(Debug)]
pub struct Registry {
    pub modules: Vec<Arc<Module>>,
}

impl Registry {
    /// Load every `*.json` descriptor in the modules directory
    ///
    /// Invalid descriptors and duplicate names are skipped with a warning;
    /// an empty registry is a configuration error.
    pub fn load(dir: &Path, defaults: &Config) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| Error::ConfigValidation(format!(
            "cannot read modules directory {}: {}",
            dir.display(),
            e
        )))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut modules: Vec<Arc<Module>> = Vec::new();
        for path in paths {
            match load_module(&path, defaults) {
                Ok(module) => {
                    if modules.iter().any(|m| m.name == module.name) {
                        warn!(
                            path = %path.display(),
                            module = %module.name,
                            "duplicate module name, skipping"
                        );
                        continue;
                    }
                    info!(
                        module = %module.name,
                        source = %module.source,
                        rules = module.rules.len(),
                        "loaded module"
                    );
                    modules.push(Arc::new(module));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping module"),
            }
        }

        if modules.is_empty() {
            return Err(Error::ConfigValidation(format!(
                "no valid modules in {}",
                dir.display()
            )));
        }

        Ok(Self { modules })
    }

    /// Group modules by the log source their lines come from
    pub fn modules_by_source(&self) -> HashMap<LogSource, Vec<Arc<Module>>> {
        let mut map: HashMap<LogSource, Vec<Arc<Module>>> = HashMap::new();
        for module in &self.modules {
            map.entry(module.source.clone())
                .or_default()
                .push(Arc::clone(module));
        }
        map
    }

    /// The union of the global whitelist and every module whitelist,
    /// used by the pruning pass
    pub fn combined_whitelist(&self, global: &Whitelist) -> Whitelist {
        let mut combined = global.clone();
        for module in &self.modules {
            combined.extend(&module.whitelist);
        }
        combined
    }
}

fn load_module(path: &Path, defaults: &Config) -> Result<Module> {
    let invalid = |reason: String| Error::ModuleInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let content = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let file: ModuleFile =
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    if file.module_name.is_empty() {
        return Err(invalid("module_name is empty".into()));
    }
    if file.rules.is_empty() {
        return Err(invalid("module has no rules".into()));
    }

    let whitelist = Whitelist::parse(&file.whitelist).map_err(invalid)?;

    let mut rules = Vec::with_capacity(file.rules.len());
    for rule in file.rules {
        let matcher = Regex::new(&rule.keyword)
            .map_err(|e| invalid(format!("keyword '{}': {}", rule.keyword, e)))?;
        let detection = if let Ok(addr) = rule.detection.parse::<Ipv4Addr>() {
            Detection::Literal(addr)
        } else {
            Detection::Pattern(
                Regex::new(&rule.detection)
                    .map_err(|e| invalid(format!("detection '{}': {}", rule.detection, e)))?,
            )
        };
        let user = match rule.user {
            Some(pattern) => Some(
                Regex::new(&pattern)
                    .map_err(|e| invalid(format!("user '{}': {}", pattern, e)))?,
            ),
            None => None,
        };

        rules.push(Rule {
            service_id: rule.service_id,
            keyword: rule.keyword,
            matcher,
            detection,
            user,
        });
    }

    let jail_attempt = file.jail_attempt.unwrap_or(defaults.default_attempt);
    if jail_attempt == 0 {
        return Err(invalid("jail_attempt must be at least 1".into()));
    }
    let jail_duration = file.jail_duration.unwrap_or(defaults.default_jail_duration);
    let window_seconds = file
        .window_seconds
        .unwrap_or(jail_attempt as i64 * defaults.pulse as i64);

    Ok(Module {
        name: file.module_name,
        source: match file.source_log {
            Some(path) => LogSource::File(path),
            None => LogSource::Journal,
        },
        rules,
        jail_attempt,
        jail_duration,
        window_seconds,
        whitelist,
        intc_hq: file.intc_hq.map(|hq| HqPolicy {
            active: hq.active,
            report: hq.report,
            jail_total_reports: hq.jail_total_reports,
            jail_abuseipdb_score: hq.jail_abuseipdb_score,
            jail_duration: hq.jail_duration,
        }),
    })
}
