//! Shared application state handed to every axum handler.

use std::sync::Arc;

use cp_billing::BillingLedger;
use cp_collab::Gateway;
use cp_orchestrator::RunDriver;
use cp_store::DurableStore;
use dashmap::DashSet;

use crate::auth::TokenVerifier;

#[derive(Clone)]
pub struct AppState {
    /// Read-only store handle for GET handlers. `RunDriver` keeps its own
    /// clone internally for the mutating control-flow path; handlers that
    /// only read never need to go through the driver.
    pub store: Arc<dyn DurableStore>,
    pub driver: Arc<RunDriver>,
    pub billing: Arc<BillingLedger>,
    pub gateway: Arc<Gateway>,
    pub token_verifier: Arc<dyn TokenVerifier>,
    /// Documents a cross-node Redis subscriber has already been spawned
    /// for, so the WebSocket handler only spawns one per document rather
    /// than one per connection.
    pub synced_documents: Arc<DashSet<cp_base::DocumentId>>,
    /// Cross-node sync handle, `None` when running as a single node with
    /// no Redis pub/sub configured. Held separately from `gateway`
    /// (which also carries a clone for its own publishes) so the
    /// WebSocket handler can spawn a per-document subscriber without
    /// reaching into the gateway's internals.
    pub sync: Option<Arc<cp_collab::RedisSync>>,
}
