use std::path::PathBuf;
use std::time::Duration;

use airfeed::config::AppConfig;
use airfeed::mqtt::command::{command_topic, CommandPublisher, CommandTrigger};
use airfeed::mqtt::config::ConnectionParams;
use airfeed::mqtt::message_manager::ingest_queue;
use airfeed::mqtt::mqtt_handler::{ConnectionManager, PublishOutcome};
use airfeed::persistence::store::ReadingStore;
use airfeed::persistence::ReadingSink;
use airfeed::telemetry::pipeline::PipelineHandle;
use airfeed::telemetry::Metric;
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = setup_config().await?;

    let (producer, consumer) = ingest_queue(config.pipeline.queue_capacity);

    let store = ReadingStore::open(&config.storage.database_path)
        .await
        .map_err(|e| eyre!("Failed to open reading store: {}", e))?;
    let sink = ReadingSink::new(store, config.storage.persist_policy);
    let pipeline = PipelineHandle::spawn(consumer, config.pipeline.clone(), sink);

    let mut manager = ConnectionManager::new(
        producer,
        Duration::from_secs(config.mqtt.keep_alive_secs),
    );
    let publisher = CommandPublisher::new(&config.commands, config.mqtt.command_suffix.clone());

    if config.mqtt.auto_connect {
        match config.mqtt.connection_params() {
            Ok(params) => connect(&mut manager, params).await,
            Err(e) => warn!("Not connecting on startup: {}", e),
        }
    }

    info!(
        "Ready. Commands: connect [host port topic], disconnect, inc, dec, hum_inc, hum_dec, export <path>, clear, status, quit"
    );
    run_console(&config, &mut manager, &publisher, &pipeline).await;

    info!("Shutting down");
    manager.disconnect().await;
    pipeline.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn setup_config() -> Result<AppConfig> {
    let path = AppConfig::default_path();
    AppConfig::ensure_default_config(&path).await?;
    let config = AppConfig::load(&path).await?;
    Ok(config)
}

async fn connect(manager: &mut ConnectionManager, params: ConnectionParams) {
    if let Err(e) = manager.connect(params).await {
        error!("Connect rejected: {}", e);
    }
}

async fn run_console(
    config: &AppConfig,
    manager: &mut ConnectionManager,
    publisher: &CommandPublisher,
    pipeline: &PipelineHandle,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Console input closed");
                break;
            }
            Err(e) => {
                error!("Failed to read console input: {}", e);
                break;
            }
        };

        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        match command {
            "connect" => {
                let params = match args.as_slice() {
                    [] => config.mqtt.connection_params(),
                    [host, port, topic] => ConnectionParams::parse(
                        host,
                        port,
                        topic,
                        config.mqtt.username.as_deref().unwrap_or_default(),
                        config.mqtt.password.as_deref().unwrap_or_default(),
                    ),
                    _ => {
                        warn!("Usage: connect [host port topic]");
                        continue;
                    }
                };
                match params {
                    Ok(params) => connect(manager, params).await,
                    Err(e) => error!("Connect rejected: {}", e),
                }
            }
            "disconnect" => manager.disconnect().await,
            "export" => {
                let Some(path) = args.first() else {
                    warn!("Usage: export <path>");
                    continue;
                };
                match pipeline.export(PathBuf::from(path)).await {
                    Ok(rows) => info!("Exported {} rows to {}", rows, path),
                    Err(e) => error!("Export failed: {}", e),
                }
            }
            "clear" => {
                if let Err(e) = pipeline.clear().await {
                    error!("Clear failed: {}", e);
                }
            }
            "status" => print_status(config, manager, pipeline),
            "quit" | "exit" => break,
            other => match other.parse::<CommandTrigger>() {
                Ok(trigger) => match publisher.fire(manager, trigger) {
                    Ok(PublishOutcome::Published) => {}
                    Ok(PublishOutcome::Skipped) => warn!("Not connected, {} not sent", trigger),
                    Err(e) => error!("Failed to send {}: {}", trigger, e),
                },
                Err(_) => warn!("Unknown command: {}", other),
            },
        }
    }
}

fn print_status(config: &AppConfig, manager: &ConnectionManager, pipeline: &PipelineHandle) {
    let status = manager.status();
    let view = pipeline.view();

    info!(
        "Link {} | {} received, {} sent | {}",
        status.connection_state.label(),
        status.messages_received,
        status.messages_sent,
        view.readouts
    );
    if let Some(topic) = manager.active_topic() {
        info!(
            "Subscribed to {}, commands go to {}",
            topic,
            command_topic(topic, &config.mqtt.command_suffix)
        );
    }
    for metric in Metric::ALL {
        info!("{}: {} points buffered", metric, view.series.get(metric).len());
    }
    info!(
        "{} messages, {} decode failures, {} dropped, {} stored, {} store failures",
        view.stats.messages,
        view.stats.decode_failures,
        view.stats.dropped_entries,
        view.stats.storage.written,
        view.stats.storage.failed
    );
    for line in view.log.iter().rev().take(5).rev() {
        info!("{}", line);
    }
}
