use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lapin::types::FieldTable;
use tracing::info;

use track_relay::config::{create_default_config_file, Config};
use track_relay::events::{parse_chat_id, LogSink, SearchTrackEvent, SearchTrackRequest, WorkerPool};
use track_relay::rabbitmq::{
    Consumer, MessageQueue, Producer, QueueOptions, RabbitConsumer, RabbitProducer,
};
use track_relay::{logging, shutdown};

const USAGE: &str = "usage: track_relay [run | search <chat-id> <name...> | init-config [path]]";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let logging = logging::init("info");

    if args.first().map(String::as_str) == Some("init-config") {
        let path = args
            .get(1)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("track_relay.json"));
        return create_default_config_file(&path);
    }

    let config = Config::load().context("Failed to load configuration")?;
    if let Some(logging) = &logging {
        logging
            .set_level(&config.app.log_level)
            .with_context(|| format!("Invalid log level {:?}", config.app.log_level))?;
    }
    info!(config = ?config, "Configuration loaded");

    match args.first().map(String::as_str) {
        None | Some("run") => run(config).await,
        Some("search") => search(&config, &args[1..]).await,
        Some(other) => bail!("unknown command {:?}\n{}", other, USAGE),
    }
}

async fn run(config: Config) -> Result<()> {
    let policy = config.reconnect_policy();
    let producer = Arc::new(
        RabbitProducer::connect(&config.producer_config(), policy.clone())
            .await
            .context("Failed to connect producer")?,
    );
    let consumer = Arc::new(
        RabbitConsumer::connect(&config.consumer_config(), policy)
            .await
            .context("Failed to connect consumer")?,
    );

    let mut queues = vec![&config.rabbitmq.producer_queue, &config.rabbitmq.consumer_queue];
    queues.extend(config.app.dead_letter_queue.as_ref());
    for queue in queues {
        producer
            .declare_queue(queue, QueueOptions::durable(), FieldTable::default())
            .await
            .with_context(|| format!("Failed to declare queue {}", queue))?;
    }

    let deliveries = consumer
        .consume(&config.rabbitmq.consumer_queue)
        .await
        .context("Failed to start consuming")?;

    let pool = WorkerPool::start(
        config.app.event_workers,
        consumer.clone(),
        producer.clone(),
        deliveries,
        Arc::new(LogSink),
        config.worker_settings(),
    );
    info!(workers = pool.size(), queue = %config.rabbitmq.consumer_queue, "Waiting for events");

    shutdown::wait_for_signal().await?;

    // Workers settle what they hold while both channels are still open.
    consumer.stop_consuming();
    pool.join().await;
    shutdown::close_all(&[
        ("consumer", consumer as Arc<dyn MessageQueue>),
        ("producer", producer as Arc<dyn MessageQueue>),
    ])
    .await;

    info!("Stopped");
    Ok(())
}

async fn search(config: &Config, args: &[String]) -> Result<()> {
    let (chat_id, name) = match args {
        [chat_id, name @ ..] if !name.is_empty() => (chat_id, name.join(" ")),
        _ => bail!(USAGE),
    };
    parse_chat_id(chat_id)?;

    let request = SearchTrackEvent::Request(SearchTrackRequest {
        request_id: chat_id.trim().to_string(),
        name,
    });
    let body = request.encode().context("Failed to encode request")?;

    let producer = RabbitProducer::connect(&config.producer_config(), config.reconnect_policy())
        .await
        .context("Failed to connect producer")?;
    let queue = &config.rabbitmq.producer_queue;
    producer
        .declare_queue(queue, QueueOptions::durable(), FieldTable::default())
        .await?;
    producer.publish(queue, &body).await?;
    info!(queue = %queue, chat = %chat_id, "Search request published");

    producer.close().await?;
    Ok(())
}
