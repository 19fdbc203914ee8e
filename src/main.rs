use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

use deadman::cli::Args;
use deadman::config::load_config;
use deadman::metrics;
use deadman::probe::{ExternalPinger, FallbackPinger, IcmpPinger, Pinger};
use deadman::reload::{ReloadHandle, ReloadManager, reload_channel};
use deadman::scheduler::Scheduler;
use deadman::state::Store;
use deadman::tui::run_tui;

#[tokio::main]
async fn main() {
    // Logs go to stderr; the TUI and the text reporter own stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let overrides = args.overrides();
    let config = match load_config(&args.config, &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(args, config).await {
        eprintln!("deadman: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args, config: deadman::config::Config) -> Result<()> {
    let pinger: Arc<dyn Pinger> =
        Arc::new(FallbackPinger::new(IcmpPinger::new(), ExternalPinger::new()));

    let store = Arc::new(Store::new(&config.targets, config.global.timeout));
    let scheduler = Arc::new(Scheduler::new(
        config.global.clone(),
        &config.targets,
        pinger,
        store.clone(),
    ));

    let cancel = CancellationToken::new();
    let (reload_handle, reload_rx) = reload_channel();
    let tracker = TaskTracker::new();

    spawn_signal_tasks(&tracker, cancel.clone(), reload_handle.clone());

    // Reload coordinator.
    {
        let manager = ReloadManager::new(
            &args.config,
            args.overrides(),
            scheduler.clone(),
            store.clone(),
        );
        let cancel = cancel.clone();
        tracker.spawn(async move {
            manager.run(reload_rx, cancel).await;
        });
    }

    // Metrics endpoint; a bind failure takes the process down.
    if !config.global.metrics_listen.is_empty() {
        let listen = config.global.metrics_listen.clone();
        let mode = config.global.metrics_mode;
        let store = store.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = metrics::serve(&listen, mode, store, cancel.clone()).await {
                eprintln!("metrics error: {e}");
                cancel.cancel();
            }
        });
    }

    // Probe scheduler.
    {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = scheduler.run(cancel.clone()).await {
                eprintln!("scheduler error: {e}");
                cancel.cancel();
            }
        });
    }

    if config.global.ui_disable {
        run_text_reporter(&store, &cancel).await;
    } else {
        run_tui(
            store.clone(),
            config.global.clone(),
            cancel.clone(),
            reload_handle,
        )
        .await?;
    }

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    Ok(())
}

/// Ctrl-C/SIGTERM cancel the root token; SIGHUP requests a reload.
fn spawn_signal_tasks(tracker: &TaskTracker, cancel: CancellationToken, reload: ReloadHandle) {
    {
        let cancel = cancel.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => cancel.cancel(),
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        {
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let Ok(mut term) = signal(SignalKind::terminate()) else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = term.recv() => cancel.cancel(),
                }
            });
        }

        tracker.spawn(async move {
            let Ok(mut hup) = signal(SignalKind::hangup()) else {
                return;
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = hup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        reload.request();
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = reload;
    }
}

/// Headless mode: print a one-line summary per target every second.
async fn run_text_reporter(store: &Arc<Store>, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut snapshot = store.snapshot();
                if snapshot.is_empty() {
                    continue;
                }
                snapshot.sort_by(|a, b| a.name.cmp(&b.name));

                println!(
                    "[{}] targets={}",
                    chrono::Local::now().to_rfc3339(),
                    snapshot.len()
                );
                for target in &snapshot {
                    println!(
                        "- {} ({}) status={} rtt={} ok={} ng={}",
                        target.name,
                        target.address,
                        target.status,
                        deadman::tui::view::format_rtt(target.last_rtt),
                        target.consecutive_ok,
                        target.consecutive_ng,
                    );
                }
            }
        }
    }
}
