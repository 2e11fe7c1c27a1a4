//! Quota Tracker - Rolling per-user send counters against plan limits

use chrono::{DateTime, Utc};
use mailforge_common::types::UNLIMITED;
use mailforge_store::models::{day_start, hour_start, month_start, PlanLimits, QuotaRecord};
use tracing::debug;

/// Accounting window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    Hour,
    Day,
    Month,
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaWindow::Hour => write!(f, "hourly"),
            QuotaWindow::Day => write!(f, "daily"),
            QuotaWindow::Month => write!(f, "monthly"),
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// The window the decision was made against (the denying window, or the
    /// tightest applicable one on allow)
    pub window: Option<QuotaWindow>,
    pub limit: i64,
    pub used: u64,
    pub remaining: i64,
}

impl QuotaDecision {
    fn deny(window: QuotaWindow, limit: i64, used: u64, reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            window: Some(window),
            limit,
            used,
            remaining: (limit - used as i64).max(0),
        }
    }
}

/// One-shot signal that a window crossed 80% of its limit
#[derive(Debug, Clone)]
pub struct QuotaWarning {
    pub window: QuotaWindow,
    pub used: u64,
    pub limit: i64,
}

impl QuotaWarning {
    /// Usage as a percentage of the limit
    pub fn percent(&self) -> u32 {
        if self.limit <= 0 {
            0
        } else {
            ((self.used as f64 / self.limit as f64) * 100.0) as u32
        }
    }
}

/// Remaining quota for display
#[derive(Debug, Clone)]
pub struct RemainingQuota {
    pub per_hour: i64,
    pub per_day: i64,
}

impl RemainingQuota {
    /// The tightest remaining across windows
    pub fn min(&self) -> i64 {
        self.per_hour.min(self.per_day)
    }
}

/// Compute remaining quota without mutating the record.
///
/// Counters whose anchor predates the current window are treated as zero:
/// the stored value belongs to an earlier window and will be reset at the
/// next active send.
pub fn remaining_quota(
    record: &QuotaRecord,
    plan: &PlanLimits,
    system_daily_cap: i64,
    now: DateTime<Utc>,
) -> RemainingQuota {
    let used_hour = match record.hour_anchor {
        Some(anchor) if anchor >= hour_start(now) => record.sent_hour as i64,
        _ => 0,
    };
    let used_day = match record.day_anchor {
        Some(anchor) if anchor >= day_start(now) => record.sent_day as i64,
        _ => 0,
    };

    let per_hour = if plan.hourly_limit == UNLIMITED {
        i64::MAX
    } else {
        (plan.hourly_limit - used_hour).max(0)
    };
    let per_day = if plan.daily_limit == UNLIMITED {
        if system_daily_cap > 0 {
            (system_daily_cap - used_day).max(0)
        } else {
            i64::MAX
        }
    } else {
        (plan.daily_limit - used_day).max(0)
    };

    RemainingQuota { per_hour, per_day }
}

/// Quota tracker for one user
#[derive(Debug)]
pub struct QuotaTracker {
    record: QuotaRecord,
    plan: PlanLimits,
    /// Daily cap applied to unlimited plans as a system-wide fallback
    system_daily_cap: i64,
    warned_hour: bool,
    warned_day: bool,
    pending_warning: Option<QuotaWarning>,
}

impl QuotaTracker {
    /// Create a tracker over a user's persisted counters
    pub fn new(record: QuotaRecord, plan: PlanLimits, system_daily_cap: i64) -> Self {
        Self {
            record,
            plan,
            system_daily_cap,
            warned_hour: false,
            warned_day: false,
            pending_warning: None,
        }
    }

    /// The counters, for persisting
    pub fn record(&self) -> &QuotaRecord {
        &self.record
    }

    /// Consume the tracker, yielding the counters
    pub fn into_record(self) -> QuotaRecord {
        self.record
    }

    /// Lazily initialize anchors and roll windows whose boundary has been
    /// crossed. A counter is zeroed only while the user is actively sending;
    /// otherwise only the anchor advances, so a read-only refresh never
    /// discards recorded usage.
    pub fn refresh_windows(&mut self, now: DateTime<Utc>, active_send: bool) {
        let hour = hour_start(now);
        match self.record.hour_anchor {
            None => self.record.hour_anchor = Some(hour),
            Some(anchor) if hour > anchor => {
                if active_send {
                    debug!(previous = self.record.sent_hour, "Hourly window reset");
                    self.record.sent_hour = 0;
                    self.warned_hour = false;
                }
                self.record.hour_anchor = Some(hour);
            }
            _ => {}
        }

        let day = day_start(now);
        match self.record.day_anchor {
            None => self.record.day_anchor = Some(day),
            Some(anchor) if day > anchor => {
                if active_send {
                    debug!(previous = self.record.sent_day, "Daily window reset");
                    self.record.sent_day = 0;
                    self.warned_day = false;
                }
                self.record.day_anchor = Some(day);
            }
            _ => {}
        }

        let month = month_start(now);
        match self.record.month_anchor {
            None => self.record.month_anchor = Some(month),
            Some(anchor) if month > anchor => {
                if active_send {
                    debug!(previous = self.record.sent_month, "Monthly window reset");
                    self.record.sent_month = 0;
                }
                self.record.month_anchor = Some(month);
            }
            _ => {}
        }
    }

    /// Decide whether `requested` more sends are permitted right now.
    ///
    /// Check order: plan expiry, hourly limit, daily limit, then the
    /// system-wide fallback cap for unlimited plans. Called from the active
    /// sending path, so window boundaries crossed since the stored anchors
    /// are rolled first.
    pub fn can_send(&mut self, requested: u64, now: DateTime<Utc>) -> QuotaDecision {
        self.refresh_windows(now, true);

        if self.plan.is_expired(now) {
            return QuotaDecision::deny(
                QuotaWindow::Day,
                0,
                self.record.sent_day,
                "plan has expired".to_string(),
            );
        }

        if self.plan.hourly_limit != UNLIMITED
            && self.record.sent_hour as i64 + requested as i64 > self.plan.hourly_limit
        {
            return QuotaDecision::deny(
                QuotaWindow::Hour,
                self.plan.hourly_limit,
                self.record.sent_hour,
                format!(
                    "hourly limit reached ({}/{})",
                    self.record.sent_hour, self.plan.hourly_limit
                ),
            );
        }

        if self.plan.daily_limit != UNLIMITED
            && self.record.sent_day as i64 + requested as i64 > self.plan.daily_limit
        {
            return QuotaDecision::deny(
                QuotaWindow::Day,
                self.plan.daily_limit,
                self.record.sent_day,
                format!(
                    "daily limit reached ({}/{})",
                    self.record.sent_day, self.plan.daily_limit
                ),
            );
        }

        if self.plan.daily_limit == UNLIMITED
            && self.system_daily_cap > 0
            && self.record.sent_day as i64 + requested as i64 > self.system_daily_cap
        {
            return QuotaDecision::deny(
                QuotaWindow::Day,
                self.system_daily_cap,
                self.record.sent_day,
                format!(
                    "system-wide daily cap reached ({}/{})",
                    self.record.sent_day, self.system_daily_cap
                ),
            );
        }

        let remaining = remaining_quota(&self.record, &self.plan, self.system_daily_cap, now);
        let (window, limit, used) = if remaining.per_hour <= remaining.per_day {
            (QuotaWindow::Hour, self.plan.hourly_limit, self.record.sent_hour)
        } else {
            (QuotaWindow::Day, self.plan.daily_limit, self.record.sent_day)
        };

        QuotaDecision {
            allowed: true,
            reason: None,
            window: Some(window),
            limit,
            used,
            remaining: remaining.min(),
        }
    }

    /// Count `count` completed sends against every window. Never decrements.
    pub fn record_sent(&mut self, count: u64) {
        self.record.sent_hour += count;
        self.record.sent_day += count;
        self.record.sent_month += count;
        self.update_warning();
    }

    /// Take the pending approaching-limit warning, if one fired
    pub fn take_warning(&mut self) -> Option<QuotaWarning> {
        self.pending_warning.take()
    }

    // Fires once per crossing into the [80%, 90%) band of a window's limit.
    fn update_warning(&mut self) {
        if !self.warned_hour {
            if let Some(warning) = band_warning(
                QuotaWindow::Hour,
                self.record.sent_hour,
                self.plan.hourly_limit,
            ) {
                self.warned_hour = true;
                self.pending_warning = Some(warning);
                return;
            }
        }
        if !self.warned_day {
            let limit = if self.plan.daily_limit == UNLIMITED {
                self.system_daily_cap
            } else {
                self.plan.daily_limit
            };
            if let Some(warning) = band_warning(QuotaWindow::Day, self.record.sent_day, limit) {
                self.warned_day = true;
                self.pending_warning = Some(warning);
            }
        }
    }
}

fn band_warning(window: QuotaWindow, used: u64, limit: i64) -> Option<QuotaWarning> {
    if limit <= 0 {
        return None;
    }
    let fraction = used as f64 / limit as f64;
    if (0.8..0.9).contains(&fraction) {
        Some(QuotaWarning {
            window,
            used,
            limit,
        })
    } else {
        None
    }
}
