//! auth-consent service bootstrap.
//!
//! Wires the durable stores and transports together and keeps the pub/sub
//! dispatcher alive. The HTTP routing layer lives in a separate service;
//! this binary hosts the consent-authorization core itself.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use auth_consent::config::AppConfig;
use auth_consent::consent::MemoryConsentRepository;
use auth_consent::kvs::{KvClient, RedisKvStore};
use auth_consent::logging::init_logging;
use auth_consent::outbound::HttpOutboundClient;
use auth_consent::pubsub::{PubSubChannel, RedisPubSubTransport, spawn_dispatcher};
use auth_consent::workflows::WorkflowEnv;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _log_guard = init_logging(&config);
    info!(env, participant_id = %config.participant_id, "starting auth-consent");

    let store = Arc::new(RedisKvStore::new(&config.redis.url).context("redis client")?);
    store.connect().await.context("redis connect")?;
    let kvs = KvClient::new(store);

    let (transport, stream) = RedisPubSubTransport::connect(&config.redis.url)
        .await
        .context("redis pub/sub connect")?;
    let pubsub = PubSubChannel::new(transport);
    spawn_dispatcher(stream, pubsub.clone());

    let outbound = Arc::new(HttpOutboundClient::new(
        &config.outbound.peer_base_url,
        &config.outbound.als_base_url,
        &config.participant_id,
    ));
    // Relational consent storage is provided by the surrounding deployment;
    // the in-memory repository keeps a standalone instance functional.
    let repository = Arc::new(MemoryConsentRepository::new());

    let _workflow_env = WorkflowEnv {
        kvs,
        repository,
        pubsub,
        outbound,
        config: config.workflow.clone(),
    };

    info!("auth-consent ready");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    Ok(())
}
