//! Interceptor - host intrusion prevention daemon
//!
//! Watches service logs for intrusion patterns, counts offenses per
//! source address and installs timed firewall rejections once a module's
//! threshold is crossed.

mod cli;
mod clock;
mod config;
mod error;
mod firewall;
mod heartbeat;
mod hq;
mod matcher;
mod recorder;
mod registry;
mod store;
mod supervisor;
mod tailer;
mod warden;

use cli::{Cli, Commands};
use config::Config;
use error::{Error, Result};
use firewall::Iptables;
use registry::Registry;
use store::Store;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }

        Commands::Run => {
            let config = config::load(&cli.config)?;
            supervisor::init_logging(&config)?;
            supervisor::run(config)
        }

        Commands::Status { json } => {
            let config = config::load(&cli.config)?;
            status(&config, json)
        }

        Commands::Reset => {
            let config = config::load(&cli.config)?;
            if !nix::unistd::Uid::effective().is_root() {
                return Err(Error::PrivilegeDenied);
            }

            let firewall = Iptables::new(config.iptables_path.clone(), config.chain.clone());
            firewall.reset()?;
            let cleared = Store::open(&config.db_path)?.clear_jails()?;
            println!(
                "Chain {} removed; {} jail row(s) cleared.",
                config.chain, cleared
            );
            Ok(())
        }

        Commands::Check => {
            let config = config::load(&cli.config)?;
            println!(
                "Configuration OK: pulse {}s, chain {}, store {}",
                config.pulse,
                config.chain,
                config.db_path.display()
            );

            let registry = Registry::load(&config.modules_dir, &config)?;
            for module in &registry.modules {
                println!(
                    "  {:<16} source {:<24} {} rule(s), jail after {} in {}s for {}s",
                    module.name,
                    module.source.to_string(),
                    module.rules.len(),
                    module.jail_attempt,
                    module.window_seconds,
                    module.jail_duration
                );
            }

            match &config.api.intc_hq {
                Some(hq) if hq.active => println!(
                    "HQ: active (report: {}) at {}",
                    if hq.report { "on" } else { "off" },
                    hq.url
                ),
                _ => println!("HQ: not configured"),
            }
            Ok(())
        }
    }
}

/// Print active jails and the last day of offense activity
fn status(config: &Config, json: bool) -> Result<()> {
    let store = Store::open(&config.db_path)?;
    let jails = store.active_jails()?;
    let recent = store.offense_count_recent(&clock::minus_hours(24))?;
    let all_time = store.jail_history()?.len();
    let queued = store.pending_report_count()?;

    let remaining_secs = |created_on: &str, duration: i64| -> i64 {
        clock::parse(created_on)
            .map(|created| {
                let expiry = clock::plus_seconds(created, duration);
                (expiry - clock::now()).num_seconds().max(0)
            })
            .unwrap_or(0)
    };

    if json {
        let data: Vec<_> = jails
            .iter()
            .map(|j| {
                serde_json::json!({
                    "module": j.module_name,
                    "ip": j.ip_address,
                    "since": j.created_on,
                    "duration": j.duration,
                    "remaining": remaining_secs(&j.created_on, j.duration),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "jails": data,
                "jails_all_time": all_time,
                "offenses_24h": recent,
                "reports_queued": queued,
            }))
            .unwrap()
        );
        return Ok(());
    }

    if jails.is_empty() {
        println!(
            "No active jails ({} all-time). {} offense(s) in the last 24h, {} report(s) queued.",
            all_time, recent, queued
        );
        return Ok(());
    }

    println!(
        "{:<16} {:<16} {:<20} {:>9}",
        "MODULE", "IP", "SINCE", "REMAINING"
    );
    for jail in &jails {
        println!(
            "{:<16} {:<16} {:<20} {:>8}s",
            jail.module_name,
            jail.ip_address,
            jail.created_on,
            remaining_secs(&jail.created_on, jail.duration)
        );
    }
    println!(
        "\n{} jail(s) all-time. {} offense(s) in the last 24h, {} report(s) queued.",
        all_time, recent, queued
    );
    Ok(())
}
