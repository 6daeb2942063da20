use std::sync::atomic::{AtomicU64, Ordering};

/// Relative weight of each signal in the overall backpressure score.
/// Must sum to (approximately) 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureWeights {
    pub ws_connections: f64,
    pub redis_channels: f64,
    pub ot_queue_depth: f64,
    pub memory_usage: f64,
}

impl Default for BackpressureWeights {
    fn default() -> Self {
        Self {
            ws_connections: 0.30,
            redis_channels: 0.25,
            ot_queue_depth: 0.25,
            memory_usage: 0.20,
        }
    }
}

impl BackpressureWeights {
    pub fn sum(&self) -> f64 {
        self.ws_connections + self.redis_channels + self.ot_queue_depth + self.memory_usage
    }

    pub fn is_valid(&self) -> bool {
        (self.sum() - 1.0).abs() < 1e-6
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureLimits {
    pub max_ws_connections: u64,
    pub max_redis_channels: u64,
    pub ot_queue_capacity: u64,
    pub memory_limit_mb: u64,
}

impl Default for BackpressureLimits {
    fn default() -> Self {
        Self {
            max_ws_connections: 10_000,
            max_redis_channels: 1_000,
            ot_queue_capacity: 10_000,
            memory_limit_mb: 4_096,
        }
    }
}

/// One component's contribution to the overall score, for
/// `BackpressureCalculator::report`'s per-component breakdown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentContribution {
    pub current: u64,
    pub limit: u64,
    pub ratio: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureReport {
    pub ws_connections: ComponentContribution,
    pub redis_channels: ComponentContribution,
    pub ot_queue_depth: ComponentContribution,
    pub memory_usage: ComponentContribution,
    pub overall: f64,
}

/// Live gauges the calculator reads from, updated by the gateway as
/// connections/channels/queue depth/memory usage change.
#[derive(Default)]
pub struct BackpressureMetrics {
    pub ws_connections: AtomicU64,
    pub redis_channels: AtomicU64,
    pub ot_queue_depth: AtomicU64,
    pub memory_usage_mb: AtomicU64,
}

/// Weighted backpressure score over four signals.
pub struct BackpressureCalculator {
    weights: parking_lot::RwLock<BackpressureWeights>,
    limits: BackpressureLimits,
    metrics: BackpressureMetrics,
}

impl BackpressureCalculator {
    pub fn new(weights: BackpressureWeights, limits: BackpressureLimits) -> Self {
        Self {
            weights: parking_lot::RwLock::new(weights),
            limits,
            metrics: BackpressureMetrics::default(),
        }
    }

    pub fn set_ws_connections(&self, n: u64) {
        self.metrics.ws_connections.store(n, Ordering::Relaxed);
    }

    pub fn set_redis_channels(&self, n: u64) {
        self.metrics.redis_channels.store(n, Ordering::Relaxed);
    }

    pub fn set_ot_queue_depth(&self, n: u64) {
        self.metrics.ot_queue_depth.store(n, Ordering::Relaxed);
    }

    pub fn set_memory_usage_mb(&self, n: u64) {
        self.metrics.memory_usage_mb.store(n, Ordering::Relaxed);
    }

    fn ratio(current: u64, limit: u64) -> f64 {
        if limit == 0 {
            return 0.0;
        }
        (current as f64 / limit as f64).min(1.0)
    }

    /// Computes the weighted overall score and the per-component
    /// breakdown behind it.
    pub fn report(&self) -> BackpressureReport {
        let weights = *self.weights.read();
        let ws = self.metrics.ws_connections.load(Ordering::Relaxed);
        let redis = self.metrics.redis_channels.load(Ordering::Relaxed);
        let ot = self.metrics.ot_queue_depth.load(Ordering::Relaxed);
        let mem = self.metrics.memory_usage_mb.load(Ordering::Relaxed);

        let ws_ratio = Self::ratio(ws, self.limits.max_ws_connections);
        let redis_ratio = Self::ratio(redis, self.limits.max_redis_channels);
        let ot_ratio = Self::ratio(ot, self.limits.ot_queue_capacity);
        let mem_ratio = Self::ratio(mem, self.limits.memory_limit_mb);

        let ws_c = ComponentContribution {
            current: ws,
            limit: self.limits.max_ws_connections,
            ratio: ws_ratio,
            weight: weights.ws_connections,
            contribution: ws_ratio * weights.ws_connections,
        };
        let redis_c = ComponentContribution {
            current: redis,
            limit: self.limits.max_redis_channels,
            ratio: redis_ratio,
            weight: weights.redis_channels,
            contribution: redis_ratio * weights.redis_channels,
        };
        let ot_c = ComponentContribution {
            current: ot,
            limit: self.limits.ot_queue_capacity,
            ratio: ot_ratio,
            weight: weights.ot_queue_depth,
            contribution: ot_ratio * weights.ot_queue_depth,
        };
        let mem_c = ComponentContribution {
            current: mem,
            limit: self.limits.memory_limit_mb,
            ratio: mem_ratio,
            weight: weights.memory_usage,
            contribution: mem_ratio * weights.memory_usage,
        };

        let overall = ws_c.contribution + redis_c.contribution + ot_c.contribution + mem_c.contribution;

        BackpressureReport { ws_connections: ws_c, redis_channels: redis_c, ot_queue_depth: ot_c, memory_usage: mem_c, overall }
    }

    pub fn calculate(&self) -> f64 {
        self.report().overall
    }

    fn weights_mut(&self) -> parking_lot::RwLockWriteGuard<'_, BackpressureWeights> {
        self.weights.write()
    }
}

/// Self-tuning variant that nudges weights toward whichever signal is
/// currently the tightest.
pub struct AdaptiveBackpressure {
    inner: BackpressureCalculator,
    base_weights: BackpressureWeights,
    adaptation_rate: f64,
}

impl AdaptiveBackpressure {
    pub fn new(weights: BackpressureWeights, limits: BackpressureLimits, adaptation_rate: f64) -> Self {
        Self {
            inner: BackpressureCalculator::new(weights, limits),
            base_weights: weights,
            adaptation_rate,
        }
    }

    pub fn set_ws_connections(&self, n: u64) {
        self.inner.set_ws_connections(n);
    }
    pub fn set_redis_channels(&self, n: u64) {
        self.inner.set_redis_channels(n);
    }
    pub fn set_ot_queue_depth(&self, n: u64) {
        self.inner.set_ot_queue_depth(n);
    }
    pub fn set_memory_usage_mb(&self, n: u64) {
        self.inner.set_memory_usage_mb(n);
    }

    /// Computes the current report, then adapts weights for the next
    /// call: skip entirely if the spread between the tightest and
    /// slackest ratio is under `0.2` (not enough signal to act on);
    /// otherwise nudge any ratio above `0.8` up by `adaptation_rate` and
    /// any ratio below `0.3` down by half that, clamp every weight to
    /// `[0.1, 0.5]`, then renormalize so the four weights sum to `1.0`.
    pub fn report(&self) -> BackpressureReport {
        let report = self.inner.report();
        self.adapt(&report);
        report
    }

    pub fn calculate(&self) -> f64 {
        self.report().overall
    }

    fn adapt(&self, report: &BackpressureReport) {
        let mut ratios = [
            ("ws_connections", report.ws_connections.ratio),
            ("redis_channels", report.redis_channels.ratio),
            ("ot_queue_depth", report.ot_queue_depth.ratio),
            ("memory_usage", report.memory_usage.ratio),
        ];
        ratios.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let spread = ratios[0].1 - ratios[ratios.len() - 1].1;
        if spread < 0.2 {
            return;
        }

        let mut weights = self.inner.weights_mut();
        for (name, ratio) in ratios {
            let delta = if ratio > 0.8 {
                self.adaptation_rate
            } else if ratio < 0.3 {
                -self.adaptation_rate / 2.0
            } else {
                continue;
            };
            adjust_weight(&mut weights, name, delta);
        }
        normalize_weights(&mut weights);
    }

    pub fn reset_weights(&self) {
        *self.inner.weights_mut() = self.base_weights;
    }
}

fn adjust_weight(weights: &mut BackpressureWeights, name: &str, delta: f64) {
    let field = match name {
        "ws_connections" => &mut weights.ws_connections,
        "redis_channels" => &mut weights.redis_channels,
        "ot_queue_depth" => &mut weights.ot_queue_depth,
        "memory_usage" => &mut weights.memory_usage,
        _ => unreachable!("unknown backpressure component {name}"),
    };
    *field = (*field + delta).clamp(0.1, 0.5);
}

fn normalize_weights(weights: &mut BackpressureWeights) {
    let sum = weights.sum();
    if sum <= 0.0 {
        return;
    }
    weights.ws_connections /= sum;
    weights.redis_channels /= sum;
    weights.ot_queue_depth /= sum;
    weights.memory_usage /= sum;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        assert!(BackpressureWeights::default().is_valid());
    }

    #[test]
    fn report_computes_a_weighted_overall_score() {
        let calc = BackpressureCalculator::new(BackpressureWeights::default(), BackpressureLimits::default());
        calc.set_ws_connections(5_000);
        calc.set_redis_channels(0);
        calc.set_ot_queue_depth(0);
        calc.set_memory_usage_mb(0);
        let report = calc.report();
        assert!((report.overall - 0.15).abs() < 1e-9);
    }

    #[test]
    fn ratios_above_one_clamp_to_one() {
        let calc = BackpressureCalculator::new(BackpressureWeights::default(), BackpressureLimits::default());
        calc.set_ws_connections(50_000);
        assert_eq!(calc.report().ws_connections.ratio, 1.0);
    }

    #[test]
    fn adaptive_skips_adjustment_when_ratios_are_close() {
        let adaptive = AdaptiveBackpressure::new(BackpressureWeights::default(), BackpressureLimits::default(), 0.1);
        adaptive.set_ws_connections(5_000);
        adaptive.set_redis_channels(450);
        adaptive.set_ot_queue_depth(4_500);
        adaptive.set_memory_usage_mb(1_800);
        adaptive.report();
        assert_eq!(*adaptive.inner.weights.read(), BackpressureWeights::default());
    }

    #[test]
    fn adaptive_shifts_weight_toward_the_saturated_component() {
        let adaptive = AdaptiveBackpressure::new(BackpressureWeights::default(), BackpressureLimits::default(), 0.1);
        adaptive.set_ws_connections(9_500);
        adaptive.set_redis_channels(0);
        adaptive.set_ot_queue_depth(0);
        adaptive.set_memory_usage_mb(0);
        adaptive.report();
        let weights = *adaptive.inner.weights.read();
        assert!(weights.ws_connections > BackpressureWeights::default().ws_connections);
        assert!((weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reset_weights_restores_the_base_configuration() {
        let adaptive = AdaptiveBackpressure::new(BackpressureWeights::default(), BackpressureLimits::default(), 0.1);
        adaptive.set_ws_connections(10_000);
        adaptive.report();
        adaptive.reset_weights();
        assert_eq!(*adaptive.inner.weights.read(), BackpressureWeights::default());
    }
}
