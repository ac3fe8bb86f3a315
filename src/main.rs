use std::process::ExitCode;

use durable_queue::config::Config;
use durable_queue::database::{establish_connection, run_migrations};
use durable_queue::logger::init_logger;
use durable_queue::{jobs, ExponentialBackoff, JobQueue, Maintenance};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration. {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logger(config.log_level).expect("logger is only installed once");

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let connection = &mut establish_connection(&config.database_url)?;
    run_migrations(connection)?;

    let mut queue = JobQueue::new(config.database_url.clone())
        .with_default_max_retries(config.max_retries);

    if let Some(base) = config.backoff_base {
        queue = queue.with_retry_policy(ExponentialBackoff::new(base));
    }

    if let Some(known_job_types) = &config.known_job_types {
        queue = queue.with_known_types(known_job_types.iter().cloned());
    }

    let (shutdown, shutdown_rx) = watch::channel(false);

    let maintenance = Maintenance::new(
        queue.clone(),
        config.stale_timeout,
        config.completed_retention,
    );
    let interval = config.maintenance_interval;
    let maintenance_handle =
        tokio::spawn(async move { maintenance.run(interval, shutdown_rx).await });

    let app = jobs::router(queue);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    log::info!("🚀 Server running on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal. {}", e);
            }
            log::info!("Shutting down.");
        })
        .await?;

    let _ = shutdown.send(true);
    maintenance_handle.await?;

    Ok(())
}
