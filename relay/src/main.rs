mod config;
mod control_socket;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use easy_parallel::Parallel;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_client::ClientCache;
use relay_spool::{ControlSurface, DeliveryEngine, EventBus};
use relay_spool_fs::FsStorage;

use config::{Cli, Config};
use transport::DirectConnector;

const NUM_THREADS: usize = 4;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    info!(spool_root = %config.spool_root.display(), "relay starting up");

    let ex = Arc::new(smol::Executor::new());
    let (signal, shutdown) = smol::channel::unbounded::<()>();

    let (_, res): (_, anyhow::Result<()>) = Parallel::new()
        .each(0..NUM_THREADS, |_| smol::block_on(ex.run(shutdown.recv())))
        .finish(|| {
            smol::block_on(async {
                let storage = Arc::new(
                    FsStorage::open(config.spool_root.clone())
                        .await
                        .with_context(|| format!("opening spool at {}", config.spool_root.display()))?,
                );

                let recovered = relay_spool::recover_sending_entries(&*storage)
                    .await
                    .with_context(|| "recovering entries interrupted by a previous shutdown")?;
                if recovered > 0 {
                    info!(recovered, "recovered entries stuck in Sending from a previous run");
                }

                let connector = DirectConnector {
                    ehlo_name: config.ehlo_name.clone(),
                };
                let cache = Arc::new(ClientCache::new(
                    connector,
                    config.max_concurrent_send_jobs,
                    config.max_uses_per_connection,
                ));

                let events = Arc::new(EventBus::new(256));
                let engine = Arc::new(
                    DeliveryEngine::new(storage.clone(), cache.clone(), events.clone())
                        .with_give_up(Duration::from_secs(config.give_up_secs)),
                );
                let control = Arc::new(ControlSurface::new(storage.clone(), cache.clone(), events.clone()));

                // SIGINT/SIGTERM fan out to the three background tasks below
                // as their own independent shutdown signals, so each can
                // finish its in-flight work (a tick's held entry lock, an
                // accepted control connection) before exiting, rather than
                // being torn down mid-mutation.
                let (ctrlc_tx, ctrlc_rx) = smol::channel::bounded::<()>(1);
                ctrlc::set_handler(move || {
                    let _ = ctrlc_tx.try_send(());
                })
                .context("installing the SIGINT/SIGTERM handler")?;

                let (engine_signal, engine_shutdown) = smol::channel::unbounded::<()>();
                let (events_signal, events_shutdown) = smol::channel::unbounded::<()>();
                let (control_signal, control_shutdown) = smol::channel::unbounded::<()>();

                let tick_cadence = Duration::from_secs(config.tick_cadence_secs);
                let engine_task = ex.spawn({
                    let engine = engine.clone();
                    async move { engine.run_until(tick_cadence, engine_shutdown).await }
                });
                let events_task = ex.spawn({
                    let events = events.clone();
                    async move { events.run_heartbeat_until(events_shutdown).await }
                });
                let control_task = ex.spawn({
                    let control = control.clone();
                    let socket_path = config.control_socket.clone();
                    async move {
                        if let Err(e) = control_socket::run(&socket_path, control, control_shutdown).await {
                            tracing::error!(error = %e, "control socket stopped");
                        }
                    }
                });

                info!("relay up, delivery loop running");

                // No inbound surface here: accepting envelopes over SMTP is a
                // collaborator's job (see the crate-level docs). Run until a
                // shutdown signal arrives; `recover_sending_entries` handles
                // any abrupt (kill -9) restart path instead.
                let _ = ctrlc_rx.recv().await;
                info!("shutdown signal received, draining in-flight work");

                drop(engine_signal);
                drop(events_signal);
                drop(control_signal);
                engine_task.await;
                events_task.await;
                control_task.await;
                cache.close().await;

                std::mem::drop(signal);
                Ok(())
            })
        });

    res
}
