use std::sync::Arc;
use std::time::Duration;

use cp_base::{DocumentId, UserId};
use cp_ot::{transform_batch, Cursor, Document, Operation, OperationBatch, Priority};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::backpressure::{BackpressureCalculator, BackpressureLimits, BackpressureWeights};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::connection::{ClientId, ConnectionManager};
use crate::error::{CollabError, Result};
use crate::presence::{PresenceManager, UserPresence};
use crate::pubsub::RedisSync;
use crate::rate_limit::{CompositeRateLimiter, MessageThrottler, RateLimitScope, SlidingWindowLimiter, ThrottledMessageType, TokenBucketLimiter};

/// Inbound message from a WebSocket client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register { document_id: DocumentId, user_name: Option<String> },
    Operation { version: u64, operations: Vec<Operation> },
    Cursor { position: u64, selection: Option<(u64, u64)> },
    PresenceJoin,
    PresenceLeave,
    Sync { version: u64 },
    Heartbeat,
}

/// Outbound message to a WebSocket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered { version: u64, content: String, your_presence: UserPresence },
    Ack { version: u64, batch_id: Option<Uuid> },
    Operation { batch: OperationBatch },
    Cursor { user_id: UserId, client_id: ClientId, position: u64, selection: Option<(u64, u64)> },
    PresenceJoin { presence: UserPresence },
    PresenceLeave { user_id: UserId, client_id: ClientId },
    Synced { content_at_version: String, history_since_version: Vec<OperationBatch> },
    HeartbeatAck,
    Stale { user_id: UserId, client_id: ClientId },
    Idle { user_id: UserId, client_id: ClientId },
    Error { code: String, message: String, retry_after: Option<u64> },
}

/// Constructor knobs pulled from [`cp_config::Config`]'s `rate_limits`,
/// `breaker`, and `ot` sub-configs.
pub struct GatewayConfig {
    pub checkpoint_interval: u64,
    pub idle_timeout: Duration,
    pub stale_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
    pub backpressure_weights: BackpressureWeights,
    pub backpressure_limits: BackpressureLimits,
    pub operation_per_minute: u32,
    pub cursor_per_minute: u32,
    pub general_per_minute: u32,
    pub degradation_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
            idle_timeout: Duration::from_secs(300),
            stale_timeout: Duration::from_secs(3600),
            breaker: CircuitBreakerConfig::default(),
            backpressure_weights: BackpressureWeights::default(),
            backpressure_limits: BackpressureLimits::default(),
            operation_per_minute: 300,
            cursor_per_minute: 1200,
            general_per_minute: 600,
            degradation_delay: Duration::from_millis(250),
        }
    }
}

/// Binds connection tracking, presence, the OT engine, backpressure, the
/// circuit breaker, rate limiting, and (optionally) cross-node sync into
/// the single entry point the WebSocket handler drives.
pub struct Gateway {
    connections: ConnectionManager,
    presence: PresenceManager,
    documents: DashMap<DocumentId, Mutex<Document>>,
    pub breaker: CircuitBreaker,
    pub backpressure: Arc<BackpressureCalculator>,
    throttler: MessageThrottler,
    connection_limiter: CompositeRateLimiter,
    sync: Option<Arc<RedisSync>>,
    checkpoint_interval: u64,
}

impl Gateway {
    pub fn new(config: GatewayConfig, sync: Option<Arc<RedisSync>>) -> Self {
        let backpressure = Arc::new(BackpressureCalculator::new(config.backpressure_weights, config.backpressure_limits));
        let breaker = CircuitBreaker::new(config.breaker);
        breaker.set_backpressure_calculator(backpressure.clone());

        let throttler = MessageThrottler::new(
            config.operation_per_minute as f64 / 60.0,
            config.operation_per_minute,
            config.cursor_per_minute as f64 / 60.0,
            config.general_per_minute as f64 / 60.0,
            config.general_per_minute,
            true,
            config.degradation_delay,
        );

        let connection_limiter = CompositeRateLimiter::new();
        connection_limiter.add_limiter(
            "connections_per_minute",
            Box::new(SlidingWindowLimiter::new(10, Duration::from_secs(60))),
            RateLimitScope::User,
        );
        connection_limiter.add_limiter(
            "connections_per_minute_ip",
            Box::new(TokenBucketLimiter::new(20.0 / 60.0, 20)),
            RateLimitScope::Ip,
        );

        Self {
            connections: ConnectionManager::new(),
            presence: PresenceManager::new(config.idle_timeout, config.stale_timeout),
            documents: DashMap::new(),
            breaker,
            backpressure,
            throttler,
            connection_limiter,
            sync,
            checkpoint_interval: config.checkpoint_interval,
        }
    }

    fn document_entry(&self, document_id: &DocumentId) -> dashmap::mapref::one::Ref<'_, DocumentId, Mutex<Document>> {
        self.documents
            .entry(document_id.clone())
            .or_insert_with(|| Mutex::new(Document::new(document_id.clone(), self.checkpoint_interval)));
        self.documents.get(document_id).expect("just inserted")
    }

    /// Handles `register(document_id, user_name)`: joins the connection
    /// and presence roster, returning `registered{version, content,
    /// your_presence}`.
    pub fn register(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        user_name: Option<String>,
        sender: UnboundedSender<ServerMessage>,
    ) -> Result<(ClientId, ServerMessage)> {
        let info = self.connection_limiter.check(Some(&user_id.to_string()), None);
        if info.result == crate::rate_limit::RateLimitResult::Blocked {
            return Err(CollabError::RateLimited { retry_after_secs: 0 });
        }
        if info.result == crate::rate_limit::RateLimitResult::Limited {
            return Err(CollabError::RateLimited {
                retry_after_secs: info.retry_after.map(|d| d.as_secs()).unwrap_or(1),
            });
        }

        let client_id = self.connections.connect(user_id, document_id.clone(), sender);
        let presence = self.presence.join(document_id.clone(), client_id, user_id, user_name);

        let doc_ref = self.document_entry(&document_id);
        let doc = doc_ref.lock();
        let message = ServerMessage::Registered {
            version: doc.version,
            content: doc.content.clone(),
            your_presence: presence.clone(),
        };
        drop(doc);
        drop(doc_ref);

        self.connections.broadcast_to_document(&document_id, ServerMessage::PresenceJoin { presence }, Some(client_id));
        Ok((client_id, message))
    }

    /// Handles `operation(batch)`: rate-limits and breaker-checks the
    /// request, transforms the incoming batch against everything applied
    /// to the document since `version`, applies it, then acks the sender
    /// and broadcasts the transformed batch to peers (locally and, if
    /// configured, to other nodes via Redis).
    pub async fn handle_operation(
        &self,
        client_id: ClientId,
        user_id: UserId,
        document_id: DocumentId,
        version: u64,
        operations: Vec<Operation>,
    ) -> Result<ServerMessage> {
        if !self.breaker.allow_request() {
            return Err(CollabError::CircuitOpen);
        }

        let throttle = self.throttler.check_message(&user_id.to_string(), ThrottledMessageType::Operation);
        if !throttle.allowed {
            self.breaker.record_failure();
            return Err(CollabError::RateLimited { retry_after_secs: 1 });
        }
        if throttle.delayed {
            tokio::time::sleep(throttle.delay).await;
        }

        let doc_ref = self.document_entry(&document_id);
        let mut doc = doc_ref.lock();

        if version > doc.version {
            self.breaker.record_failure();
            return Err(CollabError::Ot(cp_ot::OtError::VersionAhead {
                batch_version: version,
                document_version: doc.version,
            }));
        }

        let mut transformed_ops = operations;
        for historical in &doc.history[version as usize..] {
            let (next, _) = transform_batch(&transformed_ops, &historical.operations, Priority::Right);
            transformed_ops = next;
        }

        let batch = OperationBatch::new(user_id, document_id.clone(), doc.version, transformed_ops, cp_ot::BatchSource::User)
            .map_err(CollabError::Ot)?;

        let result = doc.apply_batch(batch.clone());
        if let Err(error) = result {
            self.breaker.record_failure();
            return Err(CollabError::Ot(error));
        }
        self.breaker.record_success();
        let version = doc.version;
        drop(doc);
        drop(doc_ref);

        self.transform_presence_cursors(&document_id, &batch, client_id);

        self.connections.broadcast_to_document(&document_id, ServerMessage::Operation { batch: batch.clone() }, Some(client_id));

        if let Some(sync) = &self.sync {
            let payload = serde_json::to_value(&batch).map_err(|e| CollabError::Redis(e.to_string()))?;
            sync.publish(&document_id, payload).await?;
        }

        Ok(ServerMessage::Ack { version, batch_id: Some(batch.id) })
    }

    /// Transforms every other user's live cursor through the batch that
    /// was just applied, so presence reflects positions relative to the
    /// new content rather than the pre-edit content.
    fn transform_presence_cursors(&self, document_id: &DocumentId, batch: &OperationBatch, author: ClientId) {
        for presence in self.presence.document_presence(document_id) {
            if presence.client_id == author {
                continue;
            }
            let Some(position) = presence.cursor_position else { continue };
            let cursor = Cursor {
                user_id: presence.user_id,
                position,
                selection_start: presence.selection_start,
                selection_end: presence.selection_end,
            };
            let moved = cp_ot::transform_cursor_batch(&cursor, batch);
            let selection = match (moved.selection_start, moved.selection_end) {
                (Some(s), Some(e)) => Some((s, e)),
                _ => None,
            };
            self.presence.update_cursor(document_id, presence.client_id, moved.position, selection);
        }
    }

    /// Handles `cursor(position, selection)`: updates presence and
    /// broadcasts to peers, throttled at the gateway's loosest bucket.
    pub fn handle_cursor(
        &self,
        client_id: ClientId,
        user_id: UserId,
        document_id: DocumentId,
        position: u64,
        selection: Option<(u64, u64)>,
    ) -> Result<()> {
        let throttle = self.throttler.check_message(&user_id.to_string(), ThrottledMessageType::Cursor);
        if !throttle.allowed {
            return Err(CollabError::RateLimited { retry_after_secs: 1 });
        }

        self.presence.update_cursor(&document_id, client_id, position, selection);
        self.connections.broadcast_to_document(
            &document_id,
            ServerMessage::Cursor { user_id, client_id, position, selection },
            Some(client_id),
        );
        Ok(())
    }

    /// Applies a batch that was already applied on another node and
    /// published to this document's Redis channel: transforms it against
    /// any local history it missed, applies it, and fans it out to this
    /// node's own connections. Never re-publishes (the originating node
    /// already did), which is what keeps cross-node echoes from looping.
    pub fn apply_remote_batch(&self, batch: OperationBatch) -> Result<()> {
        let document_id = batch.document_id.clone();
        let doc_ref = self.document_entry(&document_id);
        let mut doc = doc_ref.lock();

        if batch.version > doc.version {
            // This node hasn't caught up to the version the remote batch
            // was composed against; drop it rather than apply out of
            // order. The originating node's next publish (or this
            // document's periodic resync) will carry it forward.
            return Ok(());
        }

        let mut transformed_ops = batch.operations.clone();
        for historical in &doc.history[batch.version as usize..] {
            let (next, _) = transform_batch(&transformed_ops, &historical.operations, Priority::Left);
            transformed_ops = next;
        }

        let transformed = OperationBatch::new(
            batch.user_id,
            document_id.clone(),
            doc.version,
            transformed_ops,
            cp_ot::BatchSource::Server,
        )
        .map_err(CollabError::Ot)?;

        doc.apply_batch(transformed.clone()).map_err(CollabError::Ot)?;
        drop(doc);
        drop(doc_ref);

        self.transform_presence_cursors(&document_id, &transformed, ClientId::new());
        self.connections.broadcast_to_document(&document_id, ServerMessage::Operation { batch: transformed }, None);
        Ok(())
    }

    /// Handles `sync(version)`: returns the content at that version plus
    /// every batch applied since, for a client catching up after a
    /// reconnect.
    pub fn handle_sync(&self, document_id: &DocumentId, version: u64) -> Result<ServerMessage> {
        let doc_ref = self.document_entry(document_id);
        let doc = doc_ref.lock();
        let content_at_version = doc.content_at_version(version).map_err(CollabError::Ot)?;
        let history_since_version = doc.history.get(version as usize..).map(|s| s.to_vec()).unwrap_or_default();
        Ok(ServerMessage::Synced { content_at_version, history_since_version })
    }

    /// Handles `heartbeat`: marks presence active and acknowledges.
    pub fn handle_heartbeat(&self, document_id: &DocumentId, client_id: ClientId) -> ServerMessage {
        self.presence.mark_activity(document_id, client_id);
        ServerMessage::HeartbeatAck
    }

    /// Tears down a closed connection: removes it from every index and
    /// from the document's presence set, broadcasting `presence_leave`.
    pub fn disconnect(&self, client_id: ClientId) {
        let Some(connection) = self.connections.disconnect(client_id) else { return };
        if let Some(presence) = self.presence.leave(&connection.document_id, client_id) {
            self.connections.broadcast_to_document(
                &connection.document_id,
                ServerMessage::PresenceLeave { user_id: presence.user_id, client_id },
                None,
            );
        }
    }

    /// Periodic sweep broadcasting `idle` for newly-inactive users.
    pub fn sweep_idle(&self) {
        for presence in self.presence.mark_idle_users() {
            self.connections.broadcast_to_document(
                &presence.document_id,
                ServerMessage::Idle { user_id: presence.user_id, client_id: presence.client_id },
                None,
            );
        }
    }

    /// Periodic sweep broadcasting `stale` and evicting dead presences.
    pub fn sweep_stale(&self) {
        for presence in self.presence.cleanup_stale() {
            self.connections.broadcast_to_document(
                &presence.document_id,
                ServerMessage::Stale { user_id: presence.user_id, client_id: presence.client_id },
                None,
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    /// Periodic backpressure sample: refreshes the live gauges the
    /// calculator scores against and re-evaluates the breaker. Called by
    /// the same kind of fixed-interval loop that drives `sweep_idle`/
    /// `sweep_stale`; without it the breaker's state never moves off
    /// `Closed` no matter how saturated the gateway gets.
    pub fn sample_backpressure(&self, redis_channels: u64) {
        self.backpressure.set_ws_connections(self.connection_count() as u64);
        self.backpressure.set_redis_channels(redis_channels);
        self.breaker.check_and_transition();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig::default(), None)
    }

    #[test]
    fn register_returns_empty_document_state() {
        let gw = gateway();
        let (tx, _rx) = unbounded_channel();
        let doc = DocumentId::new("doc-1");
        let (_client, message) = gw.register(UserId::new(), doc, None, tx).unwrap();
        match message {
            ServerMessage::Registered { version, content, .. } => {
                assert_eq!(version, 0);
                assert_eq!(content, "");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn operation_applies_and_acks() {
        let gw = gateway();
        let (tx, _rx) = unbounded_channel();
        let doc = DocumentId::new("doc-1");
        let user = UserId::new();
        let (client, _) = gw.register(user, doc.clone(), None, tx).unwrap();

        let ack = gw
            .handle_operation(client, user, doc.clone(), 0, vec![Operation::Insert { position: 0, text: "hi".into() }])
            .await
            .unwrap();
        assert!(matches!(ack, ServerMessage::Ack { version: 1, batch_id: Some(_) }));

        let sync = gw.handle_sync(&doc, 0).unwrap();
        match sync {
            ServerMessage::Synced { content_at_version, .. } => assert_eq!(content_at_version, ""),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_operations_transform_against_intervening_history() {
        let gw = gateway();
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let doc = DocumentId::new("doc-1");
        let user_a = UserId::new();
        let user_b = UserId::new();
        let (client_a, _) = gw.register(user_a, doc.clone(), None, tx_a).unwrap();
        let (client_b, _) = gw.register(user_b, doc.clone(), None, tx_b).unwrap();

        gw.handle_operation(client_a, user_a, doc.clone(), 0, vec![Operation::Insert { position: 0, text: "AAA".into() }])
            .await
            .unwrap();

        // user_b composed against version 0, but the document is already
        // at version 1 — their insert must shift past user_a's text.
        let ack = gw
            .handle_operation(client_b, user_b, doc.clone(), 0, vec![Operation::Insert { position: 0, text: "B".into() }])
            .await
            .unwrap();
        assert!(matches!(ack, ServerMessage::Ack { .. }));

        let synced = gw.handle_sync(&doc, 2).unwrap();
        match synced {
            ServerMessage::Synced { content_at_version, .. } => assert_eq!(content_at_version, "AAAB"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn disconnect_removes_from_every_index() {
        let gw = gateway();
        let (tx, _rx) = unbounded_channel();
        let doc = DocumentId::new("doc-1");
        let (client, _) = gw.register(UserId::new(), doc, None, tx).unwrap();
        gw.disconnect(client);
        assert_eq!(gw.connection_count(), 0);
    }

    #[tokio::test]
    async fn sample_backpressure_trips_the_breaker_under_saturation() {
        let gw = Gateway::new(
            GatewayConfig {
                backpressure_weights: BackpressureWeights {
                    ws_connections: 1.0,
                    redis_channels: 0.0,
                    ot_queue_depth: 0.0,
                    memory_usage: 0.0,
                },
                backpressure_limits: BackpressureLimits { max_ws_connections: 2, ..BackpressureLimits::default() },
                ..GatewayConfig::default()
            },
            None,
        );
        let doc = DocumentId::new("doc-1");
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let user_a = UserId::new();
        let user_b = UserId::new();
        let (client, _) = gw.register(user_a, doc.clone(), None, tx_a).unwrap();
        gw.register(user_b, doc.clone(), None, tx_b).unwrap();

        assert!(gw.breaker.is_closed());
        gw.sample_backpressure(0);
        assert!(gw.breaker.is_open());

        let result = gw.handle_operation(client, user_a, doc, 0, vec![Operation::Insert { position: 0, text: "x".into() }]).await;
        assert!(matches!(result, Err(CollabError::CircuitOpen)));
    }

    #[test]
    fn heartbeat_replies_with_ack() {
        let gw = gateway();
        let (tx, _rx) = unbounded_channel();
        let doc = DocumentId::new("doc-1");
        let (client, _) = gw.register(UserId::new(), doc.clone(), None, tx).unwrap();
        let reply = gw.handle_heartbeat(&doc, client);
        assert!(matches!(reply, ServerMessage::HeartbeatAck));
    }
}
