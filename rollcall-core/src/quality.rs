//! Link quality: per-peer score in [0, 1] from signal strength, latency, loss and retry rate.

use std::collections::HashMap;

/// Score for a peer with no measurements yet.
pub const NEUTRAL_QUALITY: f32 = 0.5;

/// Source of loss and retry telemetry for a peer. Rates are fractions in [0, 1].
pub trait LinkTelemetry: Send {
    fn packet_loss(&self, peer: &str) -> f32;
    fn retry_rate(&self, peer: &str) -> f32;
}

/// Reports zero loss and zero retries. Used until the host feeds real measurements.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTelemetry;

impl LinkTelemetry for NoTelemetry {
    fn packet_loss(&self, _peer: &str) -> f32 {
        0.0
    }

    fn retry_rate(&self, _peer: &str) -> f32 {
        0.0
    }
}

pub fn signal_score(signal_dbm: i32) -> f32 {
    match signal_dbm {
        s if s >= -50 => 1.0,
        s if s >= -70 => 0.8,
        s if s >= -90 => 0.6,
        _ => 0.4,
    }
}

pub fn latency_score(latency_ms: u64) -> f32 {
    match latency_ms {
        l if l < 100 => 1.0,
        l if l < 500 => 0.8,
        l if l < 1000 => 0.6,
        _ => 0.4,
    }
}

/// Tracks the last computed quality score per peer address.
pub struct QualityMonitor {
    scores: HashMap<String, f32>,
    telemetry: Box<dyn LinkTelemetry>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::with_telemetry(Box::new(NoTelemetry))
    }

    pub fn with_telemetry(telemetry: Box<dyn LinkTelemetry>) -> Self {
        Self {
            scores: HashMap::new(),
            telemetry,
        }
    }

    /// Recompute and store the score for `peer`. Returns the new score.
    pub fn update(&mut self, peer: &str, signal_dbm: i32, latency_ms: u64) -> f32 {
        let loss = self.telemetry.packet_loss(peer).clamp(0.0, 1.0);
        let retries = self.telemetry.retry_rate(peer).clamp(0.0, 1.0);
        let score = (signal_score(signal_dbm) + latency_score(latency_ms) + (1.0 - loss)
            + (1.0 - retries))
            / 4.0;
        self.scores.insert(peer.to_string(), score);
        score
    }

    pub fn quality(&self, peer: &str) -> f32 {
        self.scores.get(peer).copied().unwrap_or(NEUTRAL_QUALITY)
    }

    /// Up to `top_n` peers by descending score (ties by address).
    pub fn rank(&self, top_n: usize) -> Vec<(String, f32)> {
        let mut ranked: Vec<(String, f32)> =
            self.scores.iter().map(|(p, s)| (p.clone(), *s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_n);
        ranked
    }

    pub fn forget(&mut self, peer: &str) {
        self.scores.remove(peer);
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
