use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use easel_bot::admission::Admission;
use easel_bot::chat::{InflightState, RequestContext};
use easel_bot::cli::Cli;
use easel_bot::commands::CommandDispatcher;
use easel_bot::console::{run_console, ConsoleGateway};
use easel_bot::{fanout, shutdown};
use easel_core::prefs::PreferencesStore;
use easel_core::surface::BotConfig;
use easel_engine::backend::SdApiBackend;
use easel_engine::scheduler::{Scheduler, SchedulerConfig};
use easel_engine::work::LockedQueue;
use easel_engine::worker::BackendWorker;

const PREFS_AUTOSAVE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Arc::new(BotConfig::load(&cli.config)?);
    let registry = Arc::new(config.registry()?);
    let prefs = Arc::new(PreferencesStore::load(&cli.preferences)?);

    let http = reqwest::Client::new();
    let submit_queue = Arc::new(LockedQueue::new());
    let result_queue = Arc::new(LockedQueue::new());

    let workers: Vec<_> = cli
        .backends
        .iter()
        .map(|url| {
            BackendWorker::new(
                SdApiBackend::new(http.clone(), url.clone()),
                Arc::clone(&result_queue),
                registry.models().to_vec(),
            )
        })
        .collect();
    let scheduler = Scheduler::new(
        SchedulerConfig { soft_deadline: cli.soft_deadline, ..SchedulerConfig::default() },
        registry.models(),
        workers,
        Arc::clone(&submit_queue),
    )?
    .start();

    let state = Arc::new(InflightState::new());
    let gateway = Arc::new(ConsoleGateway::new(cli.output_dir.clone()));
    let fanout_stop = Arc::new(AtomicBool::new(false));
    let fanout_task = fanout::spawn_fanout(
        Arc::clone(&gateway),
        Arc::clone(&config),
        Arc::clone(&state),
        Arc::clone(&result_queue),
        Arc::clone(&fanout_stop),
    );

    let admission = Admission::new(
        Arc::clone(&registry),
        Arc::clone(&config),
        Arc::clone(&prefs),
        Arc::clone(&state),
        Arc::clone(&submit_queue),
        Arc::clone(&gateway),
        http,
    );
    let dispatcher = Arc::new(CommandDispatcher::new(
        admission,
        Arc::clone(&registry),
        Arc::clone(&config),
        Arc::clone(&prefs),
        Arc::clone(&gateway),
    ));

    let autosave_task = {
        let prefs = Arc::clone(&prefs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PREFS_AUTOSAVE).await;
                if let Err(err) = prefs.persist().await {
                    warn!(error = %format!("{err:#}"), "preferences autosave failed");
                }
            }
        })
    };

    let stop = Arc::new(AtomicBool::new(false));
    shutdown::spawn_signal_handler(Arc::clone(&stop));

    let console_task = match std::env::var("EASEL_API_KEY") {
        Ok(_) => {
            let ctx = RequestContext {
                user_id: cli.user_id,
                channel_id: cli.channel_id,
                category_id: cli.category_id,
                guild_id: cli.guild_id,
            };
            Some(tokio::spawn(run_console(
                Arc::clone(&dispatcher),
                Arc::clone(&gateway),
                ctx,
                Arc::clone(&stop),
            )))
        }
        Err(_) => {
            eprintln!("Please set EASEL_API_KEY before use; the chat front-end is disabled.");
            None
        }
    };

    info!(
        backends = cli.backends.len(),
        models = registry.models().len(),
        "easel {} running",
        env!("CARGO_PKG_VERSION")
    );

    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Drain: stop leasing new work, let workers finish, flush the results,
    // then save preferences one last time.
    scheduler.request_stop();
    scheduler.wait().await?;
    fanout_stop.store(true, Ordering::SeqCst);
    let _ = fanout_task.await;
    autosave_task.abort();
    if let Some(task) = console_task {
        task.abort();
    }
    prefs.persist_blocking()?;
    info!("easel stopped");

    Ok(())
}
