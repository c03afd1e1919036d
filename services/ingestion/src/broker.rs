//! Broker consumer and pipeline shard workers.
//!
//! The consumer drains `roaster.>`, decodes each message, and dispatches it
//! to one of N workers chosen by origin hash.  Workers verify and persist
//! sequentially, which preserves per-origin ordering while origins spread
//! across workers run in parallel.  A full shard queue backpressures the
//! consumer rather than reordering or dropping.
//!
//! NATS subjects cannot contain `/`, so the wire carries the topic path
//! with `.` separators; the translation happens here, before decoding.

use futures_util::StreamExt;
use roast_protocol::{Envelope, Origin};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::envelope;
use crate::pipeline::Pipeline;
use crate::trust::{self, KeyResolver};

/// Depth of each shard's inbound queue.
const SHARD_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connect: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("subscribe: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),
}

pub async fn connect(url: &str, client_id: &str) -> Result<async_nats::Client, BrokerError> {
    Ok(async_nats::ConnectOptions::new()
        .name(client_id)
        .retry_on_initial_connect()
        .connect(url)
        .await?)
}

/// Spawn the consumer and its shard workers.  The returned handle resolves
/// when the consumer loop ends (shutdown or subscription loss).
pub fn spawn_ingest(
    broker_url: String,
    client_id: String,
    shards: usize,
    pipeline: Arc<Pipeline>,
    resolver: Arc<KeyResolver>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_ingest(&broker_url, &client_id, shards, pipeline, resolver, shutdown).await
        {
            error!(url = %broker_url, error = %e, "broker consumer failed");
        }
    })
}

async fn run_ingest(
    broker_url: &str,
    client_id: &str,
    shards: usize,
    pipeline: Arc<Pipeline>,
    resolver: Arc<KeyResolver>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let client = connect(broker_url, client_id).await?;
    info!(url = %broker_url, shards, "broker consumer connected");
    run_consumer(client, shards, pipeline, resolver, shutdown).await
}

async fn run_consumer(
    client: async_nats::Client,
    shards: usize,
    pipeline: Arc<Pipeline>,
    resolver: Arc<KeyResolver>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let mut sub = client.subscribe("roaster.>").await?;

    let mut senders = Vec::with_capacity(shards);
    for shard in 0..shards {
        let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
        senders.push(tx);
        spawn_worker(
            shard,
            rx,
            Arc::clone(&pipeline),
            Arc::clone(&resolver),
            shutdown.clone(),
        );
    }

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = sub.next() => {
                let Some(msg) = msg else { break };
                let topic_path = subject_to_topic_path(msg.subject.as_str());
                let Some(envelope) = envelope::decode(&topic_path, &msg.payload) else {
                    continue;
                };
                let shard = shard_for(&envelope.origin, senders.len());
                if senders[shard].send(envelope).await.is_err() {
                    warn!(shard, "pipeline worker gone; stopping consumer");
                    break;
                }
            }
        }
    }
    Ok(())
}

fn spawn_worker(
    shard: usize,
    mut rx: mpsc::Receiver<Envelope>,
    pipeline: Arc<Pipeline>,
    resolver: Arc<KeyResolver>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                envelope = rx.recv() => {
                    let Some(mut envelope) = envelope else { break };
                    let annotation = trust::verify_envelope(&resolver, &envelope).await;
                    envelope.trust = Some(annotation);
                    pipeline.process(envelope).await;
                }
            }
        }
        tracing::debug!(shard, "pipeline worker stopped");
    })
}

/// `roaster.acme.plant-1.r2.telemetry` -> `roaster/acme/plant-1/r2/telemetry`.
fn subject_to_topic_path(subject: &str) -> String {
    subject.replace('.', "/")
}

/// Stable origin -> shard mapping.
fn shard_for(origin: &Origin, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    origin.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(machine: &str) -> Origin {
        Origin {
            org_id: "acme".to_owned(),
            site_id: "plant-1".to_owned(),
            machine_id: machine.to_owned(),
        }
    }

    #[test]
    fn subjects_translate_to_topic_paths() {
        assert_eq!(
            subject_to_topic_path("roaster.acme.plant-1.r2.telemetry"),
            "roaster/acme/plant-1/r2/telemetry"
        );
        assert_eq!(
            subject_to_topic_path("roaster.acme.plant-1.r2.events"),
            "roaster/acme/plant-1/r2/events"
        );
    }

    #[test]
    fn shard_assignment_is_stable_per_origin() {
        let a = origin("r1");
        for shards in [1, 2, 4, 16] {
            let first = shard_for(&a, shards);
            assert_eq!(shard_for(&a, shards), first, "same origin, same shard");
            assert!(first < shards);
        }
    }

    #[test]
    fn origins_spread_across_shards() {
        let shards = 8;
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            seen.insert(shard_for(&origin(&format!("r{i}")), shards));
        }
        assert!(seen.len() > 1, "64 machines should not all land on one shard");
    }
}
