use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cplog::config::DaemonConfig;
use cplog::engine::{EngineContext, FailureSupervisor, StreamSet, SupervisorAction};
use cplog::pidfile::PidLock;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/cplogd.json";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cplog=info,cplogd=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Hands every settled artifact to its stream.
fn poll_once(
    ctx: &EngineContext,
    streams: &mut StreamSet,
    supervisor: &mut FailureSupervisor,
    settle: Duration,
) -> Result<(), Box<dyn Error>> {
    for path in streams.pending_events(settle) {
        if ctx.is_shutdown_requested() {
            return Ok(());
        }
        let ok = match streams.dispatch(&path) {
            Ok(outcome) => {
                debug!(file=%path.display(), evicted=outcome.evicted, over_quota=outcome.over_quota, "ingested");
                true
            }
            // the engine already dropped the artifact
            Err(err) if err.is_integrity() => {
                warn!(file=%path.display(), error=%err, "rejected corrupted artifact");
                true
            }
            Err(err) => {
                error!(file=%path.display(), error=%err, "failed to ingest");
                false
            }
        };
        match supervisor.record(ok) {
            SupervisorAction::Continue => {}
            SupervisorAction::Restart => {
                warn!("too many consecutive failures, reopening every stream");
                streams.close_all();
                streams.open_all();
            }
            SupervisorAction::Fatal => {
                return Err("failures persist after reopening the streams".into());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = DaemonConfig::load(&config_path)?;
    let _pid_lock = PidLock::acquire(&config.pid_file)?;
    info!(config=%config_path.display(), root_dir=%config.root_dir.display(), "starting cplogd");

    let ctx = config.engine_context();
    let mut streams = StreamSet::build(&ctx, &config.cps)?;
    streams.open_all();
    let mut supervisor = config.supervisor();
    let settle = config.settle();

    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = ctx.shutdown.clone();
    let mut signal_task = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        shutdown.store(true, Ordering::SeqCst);
    });

    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let result = loop {
        tokio::select! {
            _ = &mut signal_task => break Ok(()),
            _ = interval.tick() => {
                if ctx.is_shutdown_requested() {
                    break Ok(());
                }
                if let Err(err) = poll_once(&ctx, &mut streams, &mut supervisor, settle) {
                    error!(error=%err, "giving up");
                    break Err(err);
                }
            }
        }
    };
    streams.close_all();
    info!(alarms = ctx.alarms.count(), "cplogd stopped");
    result
}
