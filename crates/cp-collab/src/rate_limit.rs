use std::collections::VecDeque;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Limited,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    pub result: RateLimitResult,
    pub limit: u32,
    pub remaining: i64,
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    fn allowed(limit: u32, remaining: i64) -> Self {
        Self { result: RateLimitResult::Allowed, limit, remaining, retry_after: None }
    }

    fn limited(limit: u32, retry_after: Duration) -> Self {
        Self { result: RateLimitResult::Limited, limit, remaining: 0, retry_after: Some(retry_after) }
    }

    pub fn blocked() -> Self {
        Self { result: RateLimitResult::Blocked, limit: 0, remaining: 0, retry_after: None }
    }
}

/// Common behavior shared by every limiter algorithm, so
/// [`CompositeRateLimiter`] can hold a heterogeneous set of them.
pub trait RateLimiterAlgo: Send + Sync {
    fn check(&self, key: &str) -> RateLimitInfo;
    fn reset(&self, key: &str);
    fn clear(&self);
    fn active_keys(&self) -> usize;
}

/// Caps a keyed map at `max_keys` entries, evicting the oldest (first
/// inserted) entry first.
fn evict_oldest_if_full<V>(map: &mut IndexMap<String, V>, max_keys: usize) {
    while map.len() >= max_keys {
        if map.shift_remove_index(0).is_none() {
            break;
        }
    }
}

const DEFAULT_MAX_KEYS: usize = 100_000;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous token-bucket limiter: capacity `C`, refill rate `R`
/// tokens/sec. `check` decrements a token if at least one
/// is available, else returns `Limited` with `retry_after =
/// (1-tokens)/R`.
pub struct TokenBucketLimiter {
    rate: f64,
    capacity: f64,
    buckets: Mutex<IndexMap<String, BucketState>>,
    total_checks: std::sync::atomic::AtomicU64,
    total_allowed: std::sync::atomic::AtomicU64,
}

impl TokenBucketLimiter {
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity: capacity as f64,
            buckets: Mutex::new(IndexMap::new()),
            total_checks: std::sync::atomic::AtomicU64::new(0),
            total_allowed: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn total_checks(&self) -> u64 {
        self.total_checks.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn total_allowed(&self) -> u64 {
        self.total_allowed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl RateLimiterAlgo for TokenBucketLimiter {
    fn check(&self, key: &str) -> RateLimitInfo {
        self.total_checks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(key) {
            evict_oldest_if_full(&mut buckets, DEFAULT_MAX_KEYS);
            buckets.insert(key.to_string(), BucketState { tokens: self.capacity, last_refill: now });
        }
        let bucket = buckets.get_mut(key).expect("just inserted");

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.total_allowed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            RateLimitInfo::allowed(self.capacity as u32, bucket.tokens as i64)
        } else {
            let retry_after = Duration::from_secs_f64(((1.0 - bucket.tokens) / self.rate).max(0.0));
            RateLimitInfo::limited(self.capacity as u32, retry_after)
        }
    }

    fn reset(&self, key: &str) {
        self.buckets.lock().shift_remove(key);
    }

    fn clear(&self) {
        self.buckets.lock().clear();
    }

    fn active_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Sliding-window limiter: the count of timestamps within the trailing
/// `window` must stay at or below `limit`.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<IndexMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, windows: Mutex::new(IndexMap::new()) }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = timestamps.front() {
            if now.saturating_duration_since(*front) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiterAlgo for SlidingWindowLimiter {
    fn check(&self, key: &str) -> RateLimitInfo {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        if !windows.contains_key(key) {
            evict_oldest_if_full(&mut windows, DEFAULT_MAX_KEYS);
            windows.insert(key.to_string(), VecDeque::new());
        }
        let timestamps = windows.get_mut(key).expect("just inserted");
        Self::prune(timestamps, now, self.window);

        if (timestamps.len() as u32) < self.limit {
            timestamps.push_back(now);
            RateLimitInfo::allowed(self.limit, self.limit as i64 - timestamps.len() as i64)
        } else {
            let retry_after = timestamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(self.window);
            RateLimitInfo::limited(self.limit, retry_after)
        }
    }

    fn reset(&self, key: &str) {
        self.windows.lock().shift_remove(key);
    }

    fn clear(&self) {
        self.windows.lock().clear();
    }

    fn active_keys(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Fixed-window limiter: a plain counter that zeroes out every time a
/// new wall-clock window starts.
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<IndexMap<String, (Instant, u32)>>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, windows: Mutex::new(IndexMap::new()) }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl RateLimiterAlgo for FixedWindowLimiter {
    fn check(&self, key: &str) -> RateLimitInfo {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        if !windows.contains_key(key) {
            evict_oldest_if_full(&mut windows, DEFAULT_MAX_KEYS);
            windows.insert(key.to_string(), (now, 0));
        }
        let (window_start, count) = windows.get_mut(key).expect("just inserted");
        if now.saturating_duration_since(*window_start) >= self.window {
            *window_start = now;
            *count = 0;
        }

        if *count < self.limit {
            *count += 1;
            RateLimitInfo::allowed(self.limit, (self.limit - *count) as i64)
        } else {
            let retry_after = self.window.saturating_sub(now.saturating_duration_since(*window_start));
            RateLimitInfo::limited(self.limit, retry_after)
        }
    }

    fn reset(&self, key: &str) {
        self.windows.lock().shift_remove(key);
    }

    fn clear(&self) {
        self.windows.lock().clear();
    }

    fn active_keys(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Which identifier a composed limiter keys on: user, ip, or global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    User,
    Ip,
    Global,
}

struct NamedLimiter {
    name: String,
    limiter: Box<dyn RateLimiterAlgo>,
    scope: RateLimitScope,
}

/// Runs several limiters at different scopes; any `Limited` result
/// denies the request, and a manually-maintained blocked-key set takes
/// priority over every limiter.
pub struct CompositeRateLimiter {
    limiters: Mutex<Vec<NamedLimiter>>,
    blocked: dashmap::DashSet<String>,
}

impl Default for CompositeRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeRateLimiter {
    pub fn new() -> Self {
        Self { limiters: Mutex::new(Vec::new()), blocked: dashmap::DashSet::new() }
    }

    pub fn add_limiter(&self, name: impl Into<String>, limiter: Box<dyn RateLimiterAlgo>, scope: RateLimitScope) {
        self.limiters.lock().push(NamedLimiter { name: name.into(), limiter, scope });
    }

    pub fn remove_limiter(&self, name: &str) -> bool {
        let mut limiters = self.limiters.lock();
        let before = limiters.len();
        limiters.retain(|l| l.name != name);
        limiters.len() != before
    }

    pub fn block_key(&self, key: impl Into<String>) {
        self.blocked.insert(key.into());
    }

    pub fn unblock_key(&self, key: &str) -> bool {
        self.blocked.remove(key).is_some()
    }

    /// Checks every registered limiter, keyed per its scope. `user_id`
    /// and `ip` are manually-blocked-key candidates checked first;
    /// `global` scope uses a fixed key shared by every caller.
    pub fn check(&self, user_id: Option<&str>, ip: Option<&str>) -> RateLimitInfo {
        if let Some(user_id) = user_id {
            if self.blocked.contains(user_id) {
                return RateLimitInfo::blocked();
            }
        }
        if let Some(ip) = ip {
            if self.blocked.contains(ip) {
                return RateLimitInfo::blocked();
            }
        }

        let limiters = self.limiters.lock();
        let mut last = RateLimitInfo::allowed(0, 0);
        for named in limiters.iter() {
            let key = match named.scope {
                RateLimitScope::User => user_id.unwrap_or("anonymous"),
                RateLimitScope::Ip => ip.unwrap_or("unknown"),
                RateLimitScope::Global => "global",
            };
            let info = named.limiter.check(key);
            if info.result != RateLimitResult::Allowed {
                return info;
            }
            last = info;
        }
        last
    }

    pub fn limiter_names(&self) -> Vec<String> {
        self.limiters.lock().iter().map(|l| l.name.clone()).collect()
    }
}

/// Per-type message throttling for the gateway:
/// operation batches have the tightest bucket, cursor updates the
/// loosest, general messages in between. With `enable_degradation` and
/// `retry_after <= degradation_delay`, a throttled message is deferred
/// by a short sleep instead of rejected.
pub struct MessageThrottler {
    operation: TokenBucketLimiter,
    cursor: TokenBucketLimiter,
    general: TokenBucketLimiter,
    enable_degradation: bool,
    degradation_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottledMessageType {
    Operation,
    Cursor,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleResult {
    pub allowed: bool,
    pub delayed: bool,
    pub delay: Duration,
}

impl MessageThrottler {
    pub fn new(
        operations_per_second: f64,
        operations_burst: u32,
        cursor_updates_per_second: f64,
        messages_per_second: f64,
        messages_burst: u32,
        enable_degradation: bool,
        degradation_delay: Duration,
    ) -> Self {
        Self {
            operation: TokenBucketLimiter::new(operations_per_second, operations_burst),
            cursor: TokenBucketLimiter::new(cursor_updates_per_second, (cursor_updates_per_second * 2.0) as u32),
            general: TokenBucketLimiter::new(messages_per_second, messages_burst),
            enable_degradation,
            degradation_delay,
        }
    }

    pub fn check_message(&self, user_id: &str, message_type: ThrottledMessageType) -> ThrottleResult {
        let limiter = match message_type {
            ThrottledMessageType::Operation => &self.operation,
            ThrottledMessageType::Cursor => &self.cursor,
            ThrottledMessageType::General => &self.general,
        };
        let info = limiter.check(user_id);
        if info.result == RateLimitResult::Allowed {
            return ThrottleResult { allowed: true, delayed: false, delay: Duration::ZERO };
        }
        let retry_after = info.retry_after.unwrap_or_default();
        if self.enable_degradation && retry_after <= self.degradation_delay {
            return ThrottleResult { allowed: true, delayed: true, delay: retry_after };
        }
        ThrottleResult { allowed: false, delayed: false, delay: Duration::ZERO }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_allows_initial_burst_then_limits() {
        let limiter = TokenBucketLimiter::new(10.0, 5);
        for _ in 0..5 {
            assert_eq!(limiter.check("user_1").result, RateLimitResult::Allowed);
        }
        let info = limiter.check("user_1");
        assert_eq!(info.result, RateLimitResult::Limited);
        assert!(info.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let limiter = TokenBucketLimiter::new(10.0, 5);
        for _ in 0..5 {
            limiter.check("user_1");
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(limiter.check("user_1").result, RateLimitResult::Allowed);
    }

    #[test]
    fn token_bucket_separate_buckets_per_key() {
        let limiter = TokenBucketLimiter::new(10.0, 5);
        for _ in 0..5 {
            limiter.check("user_1");
        }
        assert_eq!(limiter.check("user_2").result, RateLimitResult::Allowed);
    }

    #[test]
    fn token_bucket_reset_restores_capacity() {
        let limiter = TokenBucketLimiter::new(10.0, 5);
        for _ in 0..5 {
            limiter.check("user_1");
        }
        limiter.reset("user_1");
        for _ in 0..5 {
            assert_eq!(limiter.check("user_1").result, RateLimitResult::Allowed);
        }
    }

    #[test]
    fn token_bucket_clear_removes_all_buckets() {
        let limiter = TokenBucketLimiter::new(10.0, 5);
        limiter.check("user_1");
        limiter.check("user_2");
        limiter.clear();
        assert_eq!(limiter.active_keys(), 0);
    }

    #[test]
    fn sliding_window_allows_up_to_limit_then_limits() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(1));
        for _ in 0..5 {
            assert_eq!(limiter.check("user_1").result, RateLimitResult::Allowed);
        }
        assert_eq!(limiter.check("user_1").result, RateLimitResult::Limited);
    }

    #[test]
    fn sliding_window_slides_after_the_window_passes() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_millis(50));
        for _ in 0..5 {
            limiter.check("user_1");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(limiter.check("user_1").result, RateLimitResult::Allowed);
    }

    #[test]
    fn fixed_window_resets_on_new_window() {
        let limiter = FixedWindowLimiter::new(5, Duration::from_millis(50));
        for _ in 0..5 {
            limiter.check("user_1");
        }
        assert_eq!(limiter.check("user_1").result, RateLimitResult::Limited);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(limiter.check("user_1").result, RateLimitResult::Allowed);
    }

    #[test]
    fn composite_applies_every_registered_limiter() {
        let composite = CompositeRateLimiter::new();
        composite.add_limiter(
            "user_limit",
            Box::new(TokenBucketLimiter::new(10.0, 5)),
            RateLimitScope::User,
        );
        composite.add_limiter(
            "global_limit",
            Box::new(TokenBucketLimiter::new(100.0, 50)),
            RateLimitScope::Global,
        );
        for _ in 0..5 {
            assert_eq!(composite.check(Some("user_1"), None).result, RateLimitResult::Allowed);
        }
        assert_eq!(composite.check(Some("user_1"), None).result, RateLimitResult::Limited);
    }

    #[test]
    fn composite_blocked_key_denies_before_checking_limiters() {
        let composite = CompositeRateLimiter::new();
        composite.add_limiter("user_limit", Box::new(TokenBucketLimiter::new(10.0, 5)), RateLimitScope::User);
        composite.block_key("bad_user");
        assert_eq!(composite.check(Some("bad_user"), None).result, RateLimitResult::Blocked);
        assert!(composite.unblock_key("bad_user"));
        assert_eq!(composite.check(Some("bad_user"), None).result, RateLimitResult::Allowed);
    }

    #[test]
    fn composite_remove_limiter_drops_it_from_the_registry() {
        let composite = CompositeRateLimiter::new();
        composite.add_limiter("user_limit", Box::new(TokenBucketLimiter::new(10.0, 5)), RateLimitScope::User);
        assert!(composite.remove_limiter("user_limit"));
        assert!(composite.limiter_names().is_empty());
    }

    #[test]
    fn message_throttler_degrades_instead_of_rejecting_within_the_delay_budget() {
        let throttler = MessageThrottler::new(10.0, 1, 30.0, 20.0, 1, true, Duration::from_millis(200));
        let first = throttler.check_message("user_1", ThrottledMessageType::Operation);
        assert!(first.allowed);
        let second = throttler.check_message("user_1", ThrottledMessageType::Operation);
        assert!(second.allowed);
        assert!(second.delayed);
    }

    #[test]
    fn message_throttler_rejects_beyond_the_degradation_budget() {
        let throttler = MessageThrottler::new(1.0, 1, 30.0, 20.0, 1, true, Duration::from_millis(1));
        throttler.check_message("user_1", ThrottledMessageType::Operation);
        let second = throttler.check_message("user_1", ThrottledMessageType::Operation);
        assert!(!second.allowed);
    }

    #[test]
    fn bounded_lru_evicts_the_oldest_key_when_full() {
        let limiter = TokenBucketLimiter::new(10.0, 5);
        // Exercise the eviction path directly against a tiny cap rather
        // than inserting 100k real keys.
        let mut map = IndexMap::new();
        for i in 0..3 {
            evict_oldest_if_full(&mut map, 3);
            map.insert(format!("k{i}"), i);
        }
        assert_eq!(map.len(), 3);
        let _ = limiter.check("warm");
    }
}
