//! Credential Pool - Outbound account rotation with health tracking
//!
//! Selection skips credentials that are cooling down or have spent their
//! own provider-side windows. Repeated failures cool a credential down with
//! a doubling duration; accumulated suspicion does the same even without a
//! failure streak. Confirmed-permanent failures remove the credential
//! outright.

use chrono::{DateTime, Utc};
use mailforge_common::config::PoolConfig;
use mailforge_common::{Error, Result};
use mailforge_store::models::Credential;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Credential selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    #[default]
    WeightedRandom,
}

impl std::str::FromStr for RotationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(RotationStrategy::RoundRobin),
            "random" => Ok(RotationStrategy::Random),
            "weighted_random" => Ok(RotationStrategy::WeightedRandom),
            other => Err(Error::Config(format!(
                "Unknown rotation strategy: {}",
                other
            ))),
        }
    }
}

/// Pool of outbound accounts for one user
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    active: usize,
    strategy: RotationStrategy,
    cooldown_floor_secs: u64,
    cooldown_ceiling_secs: u64,
    failure_threshold: u32,
    suspicion_threshold: u32,
    removal_threshold: u32,
}

impl CredentialPool {
    /// Build a pool over a user's persisted credentials
    pub fn new(credentials: Vec<Credential>, active: usize, config: &PoolConfig) -> Result<Self> {
        let strategy = config.strategy.parse()?;
        let active = if credentials.is_empty() {
            0
        } else {
            active.min(credentials.len() - 1)
        };

        Ok(Self {
            credentials,
            active,
            strategy,
            cooldown_floor_secs: config.cooldown_floor_secs,
            cooldown_ceiling_secs: config.cooldown_ceiling_secs,
            failure_threshold: config.failure_threshold,
            suspicion_threshold: config.suspicion_threshold,
            removal_threshold: config.removal_threshold,
        })
    }

    /// Override the selection strategy
    pub fn with_strategy(mut self, strategy: RotationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// All credentials, for persisting
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Index of the active credential, for persisting
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// The active credential
    pub fn current(&self) -> Option<&Credential> {
        self.credentials.get(self.active)
    }

    /// Whether any credential can still attempt a send: the pool is not
    /// empty and at least one account has room in its own windows. An
    /// all-cooling pool still attempts (rotation falls back to round-robin),
    /// so cooldowns alone never exhaust the pool.
    pub fn can_attempt(&self, now: DateTime<Utc>) -> bool {
        self.credentials.iter().any(|c| c.has_capacity(now))
    }

    fn is_selectable(&self, index: usize, now: DateTime<Utc>) -> bool {
        let cred = &self.credentials[index];
        !cred.in_cooldown(now) && cred.has_capacity(now)
    }

    /// Select the next credential.
    ///
    /// Candidates are credentials not in cooldown and with window capacity,
    /// excluding the current one unless it is the only one available. When
    /// every credential is in cooldown the pool degrades to plain
    /// round-robin regardless of strategy.
    pub fn rotate(&mut self, reason: &str, now: DateTime<Utc>) -> Result<&Credential> {
        if self.credentials.is_empty() {
            return Err(Error::PoolExhausted);
        }

        let candidates: Vec<usize> = (0..self.credentials.len())
            .filter(|&i| i != self.active && self.is_selectable(i, now))
            .collect();

        let next = if !candidates.is_empty() {
            match self.strategy {
                RotationStrategy::RoundRobin => candidates
                    .iter()
                    .copied()
                    .find(|&i| i > self.active)
                    .unwrap_or(candidates[0]),
                RotationStrategy::Random => {
                    candidates[rand::thread_rng().gen_range(0..candidates.len())]
                }
                RotationStrategy::WeightedRandom => self.weighted_pick(&candidates),
            }
        } else if self.is_selectable(self.active, now) {
            // The current credential is the only one available
            self.active
        } else {
            // Everything is cooling or spent: plain round-robin
            (self.active + 1) % self.credentials.len()
        };

        if next != self.active {
            info!(
                reason,
                from = %self.credentials[self.active].label(),
                to = %self.credentials[next].label(),
                "Rotated credential"
            );
        } else {
            debug!(reason, credential = %self.credentials[next].label(), "Rotation kept sole available credential");
        }
        self.active = next;
        Ok(&self.credentials[self.active])
    }

    // Draw a uniform value over the summed weights and pick the first
    // candidate whose cumulative weight covers it.
    fn weighted_pick(&self, candidates: &[usize]) -> usize {
        let total: f64 = candidates
            .iter()
            .map(|&i| self.credentials[i].selection_weight())
            .sum();
        let mut draw = rand::thread_rng().gen_range(0.0..total);
        for &i in candidates {
            let weight = self.credentials[i].selection_weight();
            if draw < weight {
                return i;
            }
            draw -= weight;
        }
        candidates[candidates.len() - 1]
    }

    /// Record the outcome of a send on the active credential.
    ///
    /// Returns `true` when the failure streak tripped an automatic
    /// cooldown-and-rotation.
    pub fn record_outcome(&mut self, success: bool, latency: Duration, now: DateTime<Utc>) -> bool {
        let Some(cred) = self.credentials.get_mut(self.active) else {
            return false;
        };

        cred.delivery_attempts += 1;
        cred.record_window_send(now);

        if success {
            cred.delivery_successes += 1;
            cred.consecutive_failures = 0;
            cred.suspicion_score = cred.suspicion_score.saturating_sub(1);
            cred.cooldown_streak = 0;
            debug!(
                credential = %cred.label(),
                latency_ms = latency.as_millis() as u64,
                "Delivery succeeded"
            );
            return false;
        }

        cred.consecutive_failures += 1;
        cred.suspicion_score += 1;
        warn!(
            credential = %cred.label(),
            consecutive_failures = cred.consecutive_failures,
            suspicion = cred.suspicion_score,
            latency_ms = latency.as_millis() as u64,
            "Delivery failed"
        );

        if cred.consecutive_failures >= self.failure_threshold {
            self.apply_cooldown("consecutive failures", now);
            // A credential that keeps earning cooldowns with no success in
            // between is confirmed broken: drop it instead of cycling it
            // through the pool forever.
            if self.credentials[self.active].cooldown_streak >= self.removal_threshold {
                let _ = self.remove("repeated cooldowns without recovery");
                if self.credentials.is_empty() {
                    return true;
                }
                let _ = self.rotate("removed failing credential", now);
            } else {
                let _ = self.rotate("cooldown after consecutive failures", now);
            }
            return true;
        }
        false
    }

    /// Cool the active credential down. The duration starts at the
    /// configured floor and doubles with each consecutive application up to
    /// the ceiling. The failure streak restarts afterwards.
    pub fn apply_cooldown(&mut self, reason: &str, now: DateTime<Utc>) {
        let floor = self.cooldown_floor_secs;
        let ceiling = self.cooldown_ceiling_secs;
        let Some(cred) = self.credentials.get_mut(self.active) else {
            return;
        };
        cred.apply_cooldown(now, floor, ceiling);
        cred.consecutive_failures = 0;
        warn!(
            reason,
            credential = %cred.label(),
            until = %cred.cooldown_until.map(|t| t.to_rfc3339()).unwrap_or_default(),
            streak = cred.cooldown_streak,
            "Applied cooldown"
        );
    }

    /// Add suspicion to the active credential. Crossing the threshold
    /// applies a cooldown and rotates even without a failure streak.
    ///
    /// Returns `true` when a cooldown-and-rotation was triggered.
    pub fn flag_suspicious(&mut self, score: u32, now: DateTime<Utc>) -> bool {
        let threshold = self.suspicion_threshold;
        let Some(cred) = self.credentials.get_mut(self.active) else {
            return false;
        };
        cred.suspicion_score += score;
        let suspicion = cred.suspicion_score;
        debug!(credential = %cred.label(), suspicion, added = score, "Flagged suspicious");

        if suspicion >= threshold {
            self.apply_cooldown("suspicion threshold", now);
            let _ = self.rotate("cooldown after suspicion threshold", now);
            return true;
        }
        false
    }

    /// Permanently drop the active credential from the pool. Used for
    /// confirmed permanent failures.
    pub fn remove(&mut self, reason: &str) -> Option<Credential> {
        if self.credentials.is_empty() {
            return None;
        }
        let removed = self.credentials.remove(self.active);
        if self.credentials.is_empty() {
            self.active = 0;
        } else {
            self.active %= self.credentials.len();
        }
        warn!(
            reason,
            credential = %removed.label(),
            remaining = self.credentials.len(),
            "Removed credential from pool"
        );
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn creds(n: usize) -> Vec<Credential> {
        (0..n)
            .map(|i| {
                Credential::parse(&format!("smtp{0}.example.com:465,user{0},pw{0},s{0}@example.com,Sender {0}", i))
                    .unwrap()
            })
            .collect()
    }

    fn pool(n: usize, strategy: RotationStrategy) -> CredentialPool {
        CredentialPool::new(creds(n), 0, &PoolConfig::default())
            .unwrap()
            .with_strategy(strategy)
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "round_robin".parse::<RotationStrategy>().unwrap(),
            RotationStrategy::RoundRobin
        );
        assert_eq!(
            "weighted_random".parse::<RotationStrategy>().unwrap(),
            RotationStrategy::WeightedRandom
        );
        assert!("fastest_first".parse::<RotationStrategy>().is_err());
    }

    #[test]
    fn test_rotate_skips_cooldown() {
        let now = at("2024-05-01T10:00:00Z");
        for strategy in [
            RotationStrategy::RoundRobin,
            RotationStrategy::Random,
            RotationStrategy::WeightedRandom,
        ] {
            let mut pool = pool(3, strategy);
            pool.credentials[1].cooldown_until = Some(at("2024-05-01T10:30:00Z"));

            // Whatever the strategy, the cooling credential is never chosen
            for _ in 0..20 {
                let picked = pool.rotate("test", now).unwrap().label();
                assert_ne!(picked, pool.credentials[1].label());
            }
        }
    }

    #[test]
    fn test_round_robin_wraps() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(3, RotationStrategy::RoundRobin);
        assert_eq!(pool.active_index(), 0);
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 1);
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 2);
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 0);
    }

    #[test]
    fn test_sole_credential_stays_active() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(1, RotationStrategy::WeightedRandom);
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 0);
    }

    #[test]
    fn test_all_cooling_falls_back_to_round_robin() {
        let now = at("2024-05-01T10:00:00Z");
        let until = at("2024-05-01T11:00:00Z");
        let mut pool = pool(3, RotationStrategy::WeightedRandom);
        for cred in &mut pool.credentials {
            cred.cooldown_until = Some(until);
        }

        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 1);
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 2);
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 0);
    }

    #[test]
    fn test_three_failures_trip_one_cooldown_and_rotation() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(2, RotationStrategy::RoundRobin);
        let latency = Duration::from_millis(120);

        assert!(!pool.record_outcome(false, latency, now));
        assert!(!pool.record_outcome(false, latency, now));
        assert_eq!(pool.active_index(), 0);

        // Third consecutive failure: exactly one cooldown, one rotation
        assert!(pool.record_outcome(false, latency, now));
        assert_eq!(pool.active_index(), 1);
        assert_eq!(pool.credentials[0].cooldown_streak, 1);
        assert!(pool.credentials[0].in_cooldown(now));
        assert!(!pool.credentials[1].in_cooldown(now));
        // Streak restarts so the next failure doesn't re-trip immediately
        assert_eq!(pool.credentials[0].consecutive_failures, 0);
    }

    #[test]
    fn test_success_resets_failure_streak_and_decays_suspicion() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(1, RotationStrategy::RoundRobin);
        let latency = Duration::from_millis(80);

        pool.record_outcome(false, latency, now);
        pool.record_outcome(false, latency, now);
        assert_eq!(pool.credentials[0].suspicion_score, 2);

        pool.record_outcome(true, latency, now);
        assert_eq!(pool.credentials[0].consecutive_failures, 0);
        assert_eq!(pool.credentials[0].suspicion_score, 1);

        pool.record_outcome(false, latency, now);
        pool.record_outcome(false, latency, now);
        assert!(!pool.credentials[0].in_cooldown(now));
    }

    #[test]
    fn test_suspicion_threshold_triggers_cooldown() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(2, RotationStrategy::RoundRobin);

        assert!(!pool.flag_suspicious(4, now));
        assert!(!pool.credentials[0].in_cooldown(now));

        assert!(pool.flag_suspicious(1, now));
        assert!(pool.credentials[0].in_cooldown(now));
        assert_eq!(pool.active_index(), 1);
    }

    #[test]
    fn test_remove_adjusts_active_index() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(3, RotationStrategy::RoundRobin);
        pool.rotate("test", now).unwrap();
        pool.rotate("test", now).unwrap();
        assert_eq!(pool.active_index(), 2);

        // Removing the last index wraps the active pointer
        let removed = pool.remove("permanent failure").unwrap();
        assert_eq!(removed.username, "user2");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.active_index(), 0);

        pool.remove("permanent failure").unwrap();
        pool.remove("permanent failure").unwrap();
        assert!(pool.is_empty());
        assert!(pool.current().is_none());
        assert!(pool.remove("empty").is_none());
        assert!(matches!(
            pool.rotate("test", now),
            Err(Error::PoolExhausted)
        ));
    }

    #[test]
    fn test_confirmed_permanent_failure_removes_credential() {
        let now = at("2024-05-01T10:00:00Z");
        let config = PoolConfig {
            failure_threshold: 1,
            removal_threshold: 2,
            ..PoolConfig::default()
        };
        let mut pool = CredentialPool::new(creds(1), 0, &config).unwrap();
        let latency = Duration::from_millis(50);

        // First failing cycle cools the credential down but keeps it
        assert!(pool.record_outcome(false, latency, now));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.credentials[0].cooldown_streak, 1);

        // Second cycle confirms the failure as permanent
        assert!(pool.record_outcome(false, latency, now));
        assert!(pool.is_empty());
        assert!(pool.current().is_none());
    }

    #[test]
    fn test_weighted_pick_prefers_healthy() {
        let now = at("2024-05-01T10:00:00Z");
        let mut pool = pool(3, RotationStrategy::WeightedRandom);
        // Credential 1 is badly suspicious: floor weight 0.1
        pool.credentials[1].delivery_attempts = 10;
        pool.credentials[1].suspicion_score = 20;
        // Credential 2 is healthy: weight 2.0
        pool.credentials[2].delivery_attempts = 10;
        pool.credentials[2].delivery_successes = 10;

        let mut picked_healthy = 0;
        for _ in 0..200 {
            pool.active = 0;
            pool.rotate("test", now).unwrap();
            if pool.active_index() == 2 {
                picked_healthy += 1;
            }
        }
        // Expected ~95% of draws; anything above a clear majority proves the
        // weighting is applied
        assert!(picked_healthy > 150, "healthy picked {}", picked_healthy);
    }

    #[test]
    fn test_can_attempt_false_when_all_windows_spent() {
        let now = at("2024-05-01T10:00:00Z");
        let creds = vec![
            Credential::parse("smtp.a.com:465,u,p,a@a.com,A,tls,1000,1").unwrap(),
        ];
        let mut pool = CredentialPool::new(creds, 0, &PoolConfig::default()).unwrap();
        assert!(pool.can_attempt(now));

        pool.record_outcome(true, Duration::from_millis(10), now);
        assert!(!pool.can_attempt(now));

        // Capacity returns when the hour rolls over
        assert!(pool.can_attempt(at("2024-05-01T11:00:01Z")));
    }
}
