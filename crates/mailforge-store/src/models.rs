//! Persisted models

use chrono::{DateTime, Duration, Timelike, Utc};
use mailforge_common::config::SendingConfig;
use mailforge_common::types::{campaign_id, CampaignId, OwnerId, UNLIMITED};
use mailforge_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Pending => write!(f, "pending"),
            CampaignStatus::Running => write!(f, "running"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Failed => write!(f, "failed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CampaignStatus::Pending),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Per-campaign sending pace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignOptions {
    /// Recipients processed per batch
    pub batch_size: usize,
    /// Delay between individual sends in milliseconds
    pub email_delay_ms: u64,
    /// Delay between batches in milliseconds
    pub batch_delay_ms: u64,
}

impl Default for CampaignOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            email_delay_ms: 1500,
            batch_delay_ms: 5000,
        }
    }
}

impl CampaignOptions {
    /// Build options from the configured sending defaults
    pub fn from_config(config: &SendingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            email_delay_ms: config.email_delay_ms,
            batch_delay_ms: config.batch_delay_ms,
        }
    }
}

/// One bulk-send job for a single owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_id: OwnerId,
    /// Deduplicated recipient addresses in insertion order
    pub recipients: Vec<String>,
    pub subject: String,
    pub template_body: String,
    pub status: CampaignStatus,
    /// Cursor over `recipients`; monotone, never exceeds the list length
    pub progress_index: usize,
    pub sent_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub options: CampaignOptions,
}

impl Campaign {
    /// Create a pending campaign, removing duplicate recipients while
    /// preserving insertion order.
    pub fn new(
        owner_id: OwnerId,
        recipients: Vec<String>,
        subject: impl Into<String>,
        template_body: impl Into<String>,
        options: CampaignOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let mut seen = HashSet::new();
        let recipients: Vec<String> = recipients
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .filter(|r| seen.insert(r.clone()))
            .collect();

        Self {
            id: campaign_id(owner_id, now),
            owner_id,
            recipients,
            subject: subject.into(),
            template_body: template_body.into(),
            status: CampaignStatus::Pending,
            progress_index: 0,
            sent_count: 0,
            error_count: 0,
            skipped_count: 0,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_error: None,
            options,
        }
    }

    /// Recipients not yet processed
    pub fn remaining(&self) -> usize {
        self.recipients.len().saturating_sub(self.progress_index)
    }

    /// Whether every recipient has been processed
    pub fn is_exhausted(&self) -> bool {
        self.progress_index >= self.recipients.len()
    }

    /// Calculate progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.recipients.is_empty() {
            0.0
        } else {
            (self.progress_index as f64 / self.recipients.len() as f64) * 100.0
        }
    }

    fn transition_error(&self, action: &str) -> Error {
        Error::State(format!(
            "cannot {} campaign {} in state {}",
            action, self.id, self.status
        ))
    }

    /// pending/paused -> running; stamps `started_at` on the first entry
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            CampaignStatus::Pending | CampaignStatus::Paused => {
                self.status = CampaignStatus::Running;
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                Ok(())
            }
            _ => Err(self.transition_error("start")),
        }
    }

    /// running -> paused
    pub fn pause(&mut self) -> Result<()> {
        match self.status {
            CampaignStatus::Running => {
                self.status = CampaignStatus::Paused;
                Ok(())
            }
            _ => Err(self.transition_error("pause")),
        }
    }

    /// running -> completed
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            CampaignStatus::Running => {
                self.status = CampaignStatus::Completed;
                self.ended_at = Some(now);
                Ok(())
            }
            _ => Err(self.transition_error("complete")),
        }
    }

    /// running -> failed
    pub fn fail(&mut self, now: DateTime<Utc>, reason: impl Into<String>) -> Result<()> {
        match self.status {
            CampaignStatus::Running => {
                self.status = CampaignStatus::Failed;
                self.ended_at = Some(now);
                self.last_error = Some(reason.into());
                Ok(())
            }
            _ => Err(self.transition_error("fail")),
        }
    }

    /// any non-terminal -> cancelled
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error("cancel"));
        }
        self.status = CampaignStatus::Cancelled;
        self.ended_at = Some(now);
        Ok(())
    }
}

/// Transport-level encryption for a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    Tls,
    Starttls,
    None,
}

impl std::str::FromStr for Encryption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(Encryption::Tls),
            "starttls" | "start_tls" => Ok(Encryption::Starttls),
            "none" | "plain" => Ok(Encryption::None),
            other => Err(Error::Validation(format!(
                "Unknown encryption mode: {}",
                other
            ))),
        }
    }
}

/// One outbound-sending account with its health state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub from_address: String,
    pub from_name: String,
    pub encryption: Encryption,
    /// Provider-side caps for this account; values <= 0 mean uncapped
    pub daily_limit: i64,
    pub hourly_limit: i64,

    // Mutable health state
    #[serde(default)]
    pub delivery_attempts: u64,
    #[serde(default)]
    pub delivery_successes: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub suspicion_score: u32,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Consecutive cooldown applications; doubles the next duration
    #[serde(default)]
    pub cooldown_streak: u32,

    // Per-credential send windows against its own caps
    #[serde(default)]
    pub sent_hour: u64,
    #[serde(default)]
    pub sent_day: u64,
    #[serde(default)]
    pub hour_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub day_anchor: Option<DateTime<Utc>>,
}

/// Start of the hour containing `now`
pub fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// Start of the day containing `now`
pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    hour_start(now).with_hour(0).unwrap_or(now)
}

/// Start of the month containing `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Datelike;
    day_start(now).with_day(1).unwrap_or(now)
}

impl Credential {
    /// Parse a single credential record:
    /// `host:port,username,secret,from_address,from_name[,encryption[,daily_limit[,hourly_limit]]]`
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            return Err(Error::Validation(format!(
                "Credential record needs at least 5 fields, got {}: {:?}",
                fields.len(),
                line
            )));
        }

        let (host, port) = fields[0]
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("Missing port in host field: {}", fields[0])))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid port: {}", port)))?;
        if host.is_empty() {
            return Err(Error::Validation("Empty host in credential record".into()));
        }

        let encryption = match fields.get(5) {
            Some(s) if !s.is_empty() => s.parse()?,
            _ => Encryption::Tls,
        };
        let daily_limit = match fields.get(6) {
            Some(s) if !s.is_empty() => s
                .parse()
                .map_err(|_| Error::Validation(format!("Invalid daily limit: {}", s)))?,
            _ => 1000,
        };
        let hourly_limit = match fields.get(7) {
            Some(s) if !s.is_empty() => s
                .parse()
                .map_err(|_| Error::Validation(format!("Invalid hourly limit: {}", s)))?,
            _ => 100,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username: fields[1].to_string(),
            secret: fields[2].to_string(),
            from_address: fields[3].to_string(),
            from_name: fields[4].to_string(),
            encryption,
            daily_limit,
            hourly_limit,
            delivery_attempts: 0,
            delivery_successes: 0,
            consecutive_failures: 0,
            suspicion_score: 0,
            cooldown_until: None,
            cooldown_streak: 0,
            sent_hour: 0,
            sent_day: 0,
            hour_anchor: None,
            day_anchor: None,
        })
    }

    /// Parse a newline-delimited credential list, skipping blank lines
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        input
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Display label for logs and notifications; never includes the secret
    pub fn label(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Fraction of attempts that succeeded; 0 before the first attempt
    pub fn success_rate(&self) -> f64 {
        if self.delivery_attempts == 0 {
            0.0
        } else {
            self.delivery_successes as f64 / self.delivery_attempts as f64
        }
    }

    /// Rotation weight: `max(0.1, 1 + success_rate - suspicion * 0.1)`
    pub fn selection_weight(&self) -> f64 {
        (1.0 + self.success_rate() - self.suspicion_score as f64 * 0.1).max(0.1)
    }

    /// Whether the credential is currently excluded by a cooldown
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn effective_sent_hour(&self, now: DateTime<Utc>) -> u64 {
        match self.hour_anchor {
            Some(anchor) if anchor >= hour_start(now) => self.sent_hour,
            _ => 0,
        }
    }

    fn effective_sent_day(&self, now: DateTime<Utc>) -> u64 {
        match self.day_anchor {
            Some(anchor) if anchor >= day_start(now) => self.sent_day,
            _ => 0,
        }
    }

    /// Whether this account's own hourly/daily windows still have room
    pub fn has_capacity(&self, now: DateTime<Utc>) -> bool {
        let hour_ok =
            self.hourly_limit <= 0 || (self.effective_sent_hour(now) as i64) < self.hourly_limit;
        let day_ok =
            self.daily_limit <= 0 || (self.effective_sent_day(now) as i64) < self.daily_limit;
        hour_ok && day_ok
    }

    /// Count one send attempt against this account's own windows
    pub fn record_window_send(&mut self, now: DateTime<Utc>) {
        let hour = hour_start(now);
        if self.hour_anchor != Some(hour) {
            self.hour_anchor = Some(hour);
            self.sent_hour = 0;
        }
        self.sent_hour += 1;

        let day = day_start(now);
        if self.day_anchor != Some(day) {
            self.day_anchor = Some(day);
            self.sent_day = 0;
        }
        self.sent_day += 1;
    }

    /// Apply a cooldown starting at `floor` seconds and doubling with each
    /// consecutive application, capped at `ceiling` seconds.
    pub fn apply_cooldown(&mut self, now: DateTime<Utc>, floor_secs: u64, ceiling_secs: u64) {
        let exponent = self.cooldown_streak.min(32);
        let secs = floor_secs
            .saturating_mul(1u64 << exponent)
            .min(ceiling_secs.max(floor_secs));
        self.cooldown_until = Some(now + Duration::seconds(secs as i64));
        self.cooldown_streak += 1;
    }
}

/// Plan window limits for a user; `-1` means unlimited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimits {
    pub hourly_limit: i64,
    pub daily_limit: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            hourly_limit: 50,
            daily_limit: 500,
            expires_at: None,
        }
    }
}

impl PlanLimits {
    /// Whether the plan had expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether both windows are unlimited
    pub fn is_unlimited(&self) -> bool {
        self.hourly_limit == UNLIMITED && self.daily_limit == UNLIMITED
    }
}

/// Rolling send counters for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaRecord {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub sent_hour: u64,
    #[serde(default)]
    pub sent_day: u64,
    #[serde(default)]
    pub sent_month: u64,
    /// Start of the window each counter accumulates against
    #[serde(default)]
    pub hour_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub day_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub month_anchor: Option<DateTime<Utc>>,
}

/// Durable per-user record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub plan: PlanLimits,
    #[serde(default)]
    pub quota: QuotaRecord,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub active_credential: usize,
    /// Mirror of the active campaign, including its recipient list, so a
    /// killed worker can resume from disk
    #[serde(default)]
    pub sending_state: Option<Campaign>,
}
