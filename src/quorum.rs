//! Peer reliability tracking feeding the upload engine's "prefer distinct,
//! reliable holders" dispatch preference (§4.7, open question (b)).
//!
//! Trimmed from the reference node's DHT-quorum calculator down to the part
//! the core still needs: a reliability score per peer, derived from recent
//! success/failure history and response latency, with no connection to
//! Kademlia's `Quorum` type (segment placement here is driven by C5's
//! distribution planner, not DHT write quorums).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libp2p::PeerId;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct PeerReliability {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<u64>,
    pub last_failure: Option<u64>,
    pub response_times: Vec<Duration>,
}

impl PeerReliability {
    fn new() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            last_success: None,
            last_failure: None,
            response_times: Vec::new(),
        }
    }

    /// Score in `[0.0, 1.0]`; `0.5` for a peer with no recorded history.
    pub fn score(&self) -> f64 {
        let total_ops = self.success_count + self.failure_count;
        if total_ops == 0 {
            return 0.5;
        }

        let base_score = self.success_count as f64 / total_ops as f64;

        let now = now_secs();
        let mut time_factor = 1.0;
        if let Some(last_failure) = self.last_failure {
            let since = now.saturating_sub(last_failure);
            if since < 300 {
                time_factor = 0.5;
            } else if since < 3600 {
                time_factor = 0.8;
            }
        }

        let response_factor = if !self.response_times.is_empty() {
            let avg_ms = self.response_times.iter().sum::<Duration>().as_millis() as f64
                / self.response_times.len() as f64;
            if avg_ms < 1000.0 {
                1.2
            } else if avg_ms < 5000.0 {
                1.0
            } else {
                0.8
            }
        } else {
            1.0
        };

        (base_score * time_factor * response_factor).min(1.0)
    }

    fn record_success(&mut self, response_time: Duration) {
        self.success_count += 1;
        self.last_success = Some(now_secs());
        self.response_times.push(response_time);
        if self.response_times.len() > 10 {
            self.response_times.remove(0);
        }
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(now_secs());
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Shared, thread-safe registry of per-peer reliability, consulted by the
/// upload engine's dispatch planning and updated by both engines as sends
/// and fetches succeed or fail.
#[derive(Clone)]
pub struct PeerRegistry {
    reliability: Arc<RwLock<HashMap<PeerId, PeerReliability>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            reliability: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record_success(&self, peer: PeerId, response_time: Duration) {
        let mut map = self.reliability.write().await;
        map.entry(peer).or_insert_with(PeerReliability::new).record_success(response_time);
    }

    pub async fn record_failure(&self, peer: PeerId) {
        let mut map = self.reliability.write().await;
        map.entry(peer).or_insert_with(PeerReliability::new).record_failure();
    }

    pub async fn score(&self, peer: &PeerId) -> f64 {
        self.reliability
            .read()
            .await
            .get(peer)
            .map(|r| r.score())
            .unwrap_or(0.5)
    }

    /// Sort `candidates` by descending reliability score, most reliable first.
    pub async fn rank(&self, candidates: &[PeerId]) -> Vec<PeerId> {
        let map = self.reliability.read().await;
        let mut scored: Vec<(PeerId, f64)> = candidates
            .iter()
            .map(|p| (*p, map.get(p).map(|r| r.score()).unwrap_or(0.5)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(p, _)| p).collect()
    }

    pub async fn cleanup_stale(&self, max_age_hours: u64) {
        let cutoff = now_secs().saturating_sub(max_age_hours * 3600);
        let mut map = self.reliability.write().await;
        map.retain(|_, r| {
            r.last_success.unwrap_or(0) > cutoff || r.last_failure.unwrap_or(0) > cutoff
        });
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_peer_has_neutral_score() {
        let registry = PeerRegistry::new();
        let peer = PeerId::random();
        assert_eq!(registry.score(&peer).await, 0.5);
    }

    #[tokio::test]
    async fn successes_raise_score_above_neutral() {
        let registry = PeerRegistry::new();
        let peer = PeerId::random();
        registry.record_success(peer, Duration::from_millis(100)).await;
        registry.record_success(peer, Duration::from_millis(100)).await;
        assert!(registry.score(&peer).await > 0.5);
    }

    #[tokio::test]
    async fn ranking_prefers_more_reliable_peer() {
        let registry = PeerRegistry::new();
        let good = PeerId::random();
        let bad = PeerId::random();
        registry.record_success(good, Duration::from_millis(50)).await;
        registry.record_failure(bad).await;
        registry.record_failure(bad).await;

        let ranked = registry.rank(&[bad, good]).await;
        assert_eq!(ranked[0], good);
    }
}
