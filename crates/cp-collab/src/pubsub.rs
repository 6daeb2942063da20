use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use cp_base::DocumentId;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::error::{CollabError, Result};

pub fn global_channel() -> &'static str {
    "collab:sync:global"
}

pub fn document_channel(document_id: &DocumentId) -> String {
    format!("collab:sync:{}", document_id.as_str())
}

/// Cross-node broadcast envelope: every outbound
/// broadcast also publishes one of these so other nodes can apply it
/// locally, tagged with the id and originating pod so receivers can
/// de-duplicate and skip their own publications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub message_id: Uuid,
    pub source_pod: String,
    pub document_id: DocumentId,
    pub payload: serde_json::Value,
}

/// Fixed-capacity ring of recently-seen message ids, so a subscriber can
/// skip an envelope it's already applied. Oldest entries fall off the
/// back once the ring is full.
pub struct DedupRing {
    capacity: usize,
    state: Mutex<(VecDeque<Uuid>, HashSet<Uuid>)>,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, state: Mutex::new((VecDeque::with_capacity(capacity), HashSet::new())) }
    }

    /// Records `id` if not already seen, returning `true` if this is the
    /// first time it's been observed (i.e. the caller should act on it).
    pub fn check_and_record(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        let (order, seen) = &mut *state;
        if !seen.insert(id) {
            return false;
        }
        order.push_back(id);
        if order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().0.len()
    }
}

/// Redis-backed cross-node sync. Each gateway node
/// publishes every locally-applied broadcast to its document's channel
/// (and the global channel) and subscribes to the same channels to pick
/// up broadcasts applied on other nodes.
pub struct RedisSync {
    pod_id: String,
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    dedup: Arc<DedupRing>,
}

impl RedisSync {
    pub async fn connect(url: &str, pod_id: String, dedup_capacity: usize) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| CollabError::Redis(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CollabError::Redis(e.to_string()))?;
        Ok(Self { pod_id, client, conn, dedup: Arc::new(DedupRing::new(dedup_capacity)) })
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn dedup(&self) -> Arc<DedupRing> {
        self.dedup.clone()
    }

    /// Publishes `payload` to `document_id`'s channel, stamped with a
    /// fresh message id and this node's pod id. The publishing node also
    /// records the id in its own dedup ring so a self-subscription echo
    /// (if one somehow arrives) is dropped rather than re-applied.
    pub async fn publish(&self, document_id: &DocumentId, payload: serde_json::Value) -> Result<()> {
        let envelope = SyncEnvelope {
            message_id: Uuid::new_v4(),
            source_pod: self.pod_id.clone(),
            document_id: document_id.clone(),
            payload,
        };
        self.dedup.check_and_record(envelope.message_id);
        let raw = serde_json::to_string(&envelope).map_err(|e| CollabError::Redis(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(document_channel(document_id), raw)
            .await
            .map_err(|e| CollabError::Redis(e.to_string()))?;
        Ok(())
    }

    /// Spawns a background task subscribing to `document_id`'s channel
    /// and the global channel, forwarding newly-seen, non-self-originated
    /// envelopes to `sink`. Reconnects with a short backoff if the
    /// subscription drops.
    pub fn spawn_subscriber(&self, document_id: DocumentId, sink: UnboundedSender<SyncEnvelope>) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let pod_id = self.pod_id.clone();
        let dedup = self.dedup.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if pubsub.subscribe(document_channel(&document_id)).await.is_err() {
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            continue;
                        }
                        if pubsub.subscribe(global_channel()).await.is_err() {
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let Ok(payload) = msg.get_payload::<String>() else { continue };
                            let Ok(envelope) = serde_json::from_str::<SyncEnvelope>(&payload) else { continue };
                            if envelope.source_pod == pod_id {
                                continue;
                            }
                            if !dedup.check_and_record(envelope.message_id) {
                                continue;
                            }
                            if sink.send(envelope).is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "redis pubsub subscribe failed, retrying");
                    }
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_ring_drops_previously_seen_ids() {
        let ring = DedupRing::new(4);
        let id = Uuid::new_v4();
        assert!(ring.check_and_record(id));
        assert!(!ring.check_and_record(id));
    }

    #[test]
    fn dedup_ring_evicts_oldest_once_full() {
        let ring = DedupRing::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        ring.check_and_record(a);
        ring.check_and_record(b);
        ring.check_and_record(c);
        assert_eq!(ring.len(), 2);
        assert!(ring.check_and_record(a));
    }

    #[test]
    fn channel_names_use_the_collab_sync_prefix() {
        let doc = DocumentId::new("doc-1");
        assert_eq!(document_channel(&doc), "collab:sync:doc-1");
        assert_eq!(global_channel(), "collab:sync:global");
    }
}
