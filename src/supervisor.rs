//! Supervisor
//!
//! Owns the daemon lifecycle: startup order, worker handles, shutdown and
//! firewall cleanup. Workers block on I/O, so they run on the blocking
//! pool; the supervisor itself only waits for Ctrl+C.

use crate::clock::Identity;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::firewall::{Chain, Iptables};
use crate::heartbeat::Heartbeat;
use crate::hq::HqClient;
use crate::matcher::MatcherWorker;
use crate::recorder::Recorder;
use crate::registry::{Registry, Whitelist};
use crate::store::Store;
use crate::tailer::FollowerSet;
use crate::warden::Warden;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Initialize structured logging: stderr plus the daemon log file
pub fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(&config.logs_dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.logs_dir.join("intercept.log"))?;

    let filter = EnvFilter::try_from_env("INTERCEPTOR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stderr.and(std::sync::Mutex::new(file)))
        .init();
    Ok(())
}

/// Run the daemon until Ctrl+C
pub fn run(config: Config) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::PrivilegeDenied);
    }

    let identity = Identity::resolve();
    info!(
        hostname = %identity.hostname,
        ipv4 = %identity.ipv4,
        version = %config.version,
        "interceptor starting"
    );

    let store = Arc::new(Store::open(&config.db_path)?);
    let firewall = Arc::new(Iptables::new(
        config.iptables_path.clone(),
        config.chain.clone(),
    ));
    firewall.init()?;

    let registry = Registry::load(&config.modules_dir, &config)?;
    let global_whitelist =
        Whitelist::parse(&config.whitelist).map_err(Error::ConfigValidation)?;

    let warden = Arc::new(Warden::new(
        Arc::clone(&store),
        Arc::clone(&firewall) as Arc<dyn Chain>,
        global_whitelist.clone(),
    ));
    let recorder = Recorder::new(Arc::clone(&store));
    let hq = Arc::new(HqClient::new(
        config.api.intc_hq.clone(),
        identity.hostname.clone(),
        config.version.clone(),
    ));

    let quit = Arc::new(AtomicBool::new(false));
    let followers = Arc::new(FollowerSet::new());

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    runtime.block_on(async {
        let mut handles = Vec::new();

        let heartbeat = Heartbeat::new(
            Arc::clone(&store),
            Arc::clone(&warden),
            Arc::clone(&hq),
            registry.combined_whitelist(&global_whitelist),
            config.pulse,
            config.hq_pulse_every,
            Arc::clone(&quit),
        );
        handles.push(tokio::task::spawn_blocking(move || heartbeat.run()));

        for (slot, (source, modules)) in registry.modules_by_source().into_iter().enumerate() {
            let worker = MatcherWorker::new(
                slot,
                source,
                modules,
                recorder.clone(),
                Arc::clone(&warden),
                Arc::clone(&followers),
                Arc::clone(&quit),
            );
            handles.push(tokio::task::spawn_blocking(move || worker.run()));
        }

        // Best-effort announce, off the signal path
        let hq_hello = Arc::clone(&hq);
        tokio::task::spawn_blocking(move || {
            if hq_hello.active() {
                let announced = hq_hello.hello();
                info!(announced, "HQ hello");
            }
        });

        info!("interceptor running, Ctrl+C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "signal listener failed");
        }

        info!("shutting down");
        quit.store(true, Ordering::Relaxed);
        followers.terminate_all();
        for handle in handles {
            let _ = handle.await;
        }
    });

    firewall.reset()?;
    info!("firewall chain removed");
    Ok(())
}
