//! Real-time collaboration gateway: WebSocket fan-in/fan-out with an OT
//! engine, presence, backpressure-driven circuit breaking, rate
//! limiting, and cross-node Redis sync.

pub mod backpressure;
pub mod circuit_breaker;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod pubsub;
pub mod rate_limit;

pub use backpressure::{
    AdaptiveBackpressure, BackpressureCalculator, BackpressureLimits, BackpressureReport, BackpressureWeights,
};
pub use circuit_breaker::{ActivationReason, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use connection::{ClientId, Connection, ConnectionManager};
pub use error::{CollabError, Result};
pub use gateway::{ClientMessage, Gateway, GatewayConfig, ServerMessage};
pub use presence::{PresenceEvent, PresenceManager, UserPresence};
pub use pubsub::{document_channel, global_channel, DedupRing, RedisSync, SyncEnvelope};
pub use rate_limit::{
    CompositeRateLimiter, FixedWindowLimiter, MessageThrottler, RateLimitInfo, RateLimitResult, RateLimitScope,
    RateLimiterAlgo, SlidingWindowLimiter, ThrottleResult, ThrottledMessageType, TokenBucketLimiter,
};
