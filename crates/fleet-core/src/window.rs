//! Multi-window token limits and reset boundaries.
//!
//! Each agent has a daily, weekly, and monthly window. A window's counter is
//! reset lazily: the first touch at or after its `next_reset` zeroes the
//! counter and computes the following boundary from the touch time. No
//! background sweep is required.
//!
//! Boundaries are computed in the timezone of the `now` passed in (the
//! engine passes `chrono::Local`), and stored as UTC.

use crate::{AgentId, AgentType, TokenCount};
use chrono::{
    DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default daily limit applied when an agent is first tracked.
pub const DEFAULT_DAILY_LIMIT: u64 = 100_000;

/// Default weekly limit applied when an agent is first tracked.
pub const DEFAULT_WEEKLY_LIMIT: u64 = 500_000;

/// Default monthly limit applied when an agent is first tracked.
pub const DEFAULT_MONTHLY_LIMIT: u64 = 2_000_000;

// ============================================================================
// Windows
// ============================================================================

/// An accounting period with its own limit and reset boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    Daily,
    Weekly,
    Monthly,
}

impl UsageWindow {
    pub const ALL: [UsageWindow; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// The first reset boundary strictly after `last`.
    pub fn next_reset<Tz: TimeZone>(&self, last: &DateTime<Tz>) -> DateTime<Tz> {
        match self {
            Self::Daily => next_daily_reset(last),
            Self::Weekly => next_weekly_reset(last),
            Self::Monthly => next_monthly_reset(last),
        }
    }
}

impl fmt::Display for UsageWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Local midnight of the day after `last`.
pub fn next_daily_reset<Tz: TimeZone>(last: &DateTime<Tz>) -> DateTime<Tz> {
    let date = last.date_naive();
    midnight(&last.timezone(), add_days(date, 1))
}

/// The next Monday 00:00 after `last`.
///
/// When `last` is itself a Monday, the same-day midnight is not after
/// `last`, so the boundary moves to the following Monday.
pub fn next_weekly_reset<Tz: TimeZone>(last: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = last.timezone();
    let date = last.date_naive();
    let days_until_monday = (7 - date.weekday().num_days_from_monday()) % 7;
    let monday = add_days(date, u64::from(days_until_monday));
    let candidate = midnight(&tz, monday);
    if candidate <= *last {
        midnight(&tz, add_days(monday, 7))
    } else {
        candidate
    }
}

/// The 1st of the calendar month after `last`, at 00:00.
pub fn next_monthly_reset<Tz: TimeZone>(last: &DateTime<Tz>) -> DateTime<Tz> {
    let date = last.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_else(|| add_days(date, 31));
    midnight(&last.timezone(), first)
}

fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(date)
}

/// 00:00 of `date` in `tz`.
///
/// Ambiguous midnights resolve to the earlier instant; a midnight skipped by
/// a DST gap resolves to the first valid instant after it.
fn midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let naive = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = naive + TimeDelta::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
                LocalResult::None => tz.from_utc_datetime(&naive),
            }
        }
    }
}

// ============================================================================
// Window Usage
// ============================================================================

/// Usage counted in one window since its last reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub used: TokenCount,
    pub last_reset: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
}

impl WindowUsage {
    /// Starts a window at `now`.
    pub fn starting_at<Tz: TimeZone>(window: UsageWindow, now: &DateTime<Tz>) -> Self {
        Self {
            used: TokenCount::zero(),
            last_reset: now.with_timezone(&Utc),
            next_reset: window.next_reset(now).with_timezone(&Utc),
        }
    }

    /// Resets the counter if `now` has reached the boundary.
    ///
    /// Returns true when a reset happened.
    pub fn roll<Tz: TimeZone>(&mut self, window: UsageWindow, now: &DateTime<Tz>) -> bool {
        if now.with_timezone(&Utc) < self.next_reset {
            return false;
        }
        *self = Self::starting_at(window, now);
        true
    }
}

// ============================================================================
// Token Limit
// ============================================================================

/// Partial update of an agent's limits. `None` keeps the prior value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitUpdate {
    pub daily: Option<u64>,
    pub weekly: Option<u64>,
    pub monthly: Option<u64>,
}

impl LimitUpdate {
    pub fn daily(limit: u64) -> Self {
        Self {
            daily: Some(limit),
            ..Self::default()
        }
    }
}

/// Per-agent limits and the usage counted against them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLimit {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub daily_limit: TokenCount,
    pub weekly_limit: TokenCount,
    pub monthly_limit: TokenCount,
    pub daily: WindowUsage,
    pub weekly: WindowUsage,
    pub monthly: WindowUsage,
}

impl TokenLimit {
    /// Creates a limit with the default 100k/500k/2M windows starting at `now`.
    pub fn new<Tz: TimeZone>(agent_id: AgentId, agent_type: AgentType, now: &DateTime<Tz>) -> Self {
        Self::with_defaults(
            agent_id,
            agent_type,
            LimitUpdate {
                daily: Some(DEFAULT_DAILY_LIMIT),
                weekly: Some(DEFAULT_WEEKLY_LIMIT),
                monthly: Some(DEFAULT_MONTHLY_LIMIT),
            },
            now,
        )
    }

    /// Creates a limit whose windows default to `defaults` (falling back to
    /// the built-in defaults for unset fields).
    pub fn with_defaults<Tz: TimeZone>(
        agent_id: AgentId,
        agent_type: AgentType,
        defaults: LimitUpdate,
        now: &DateTime<Tz>,
    ) -> Self {
        Self {
            agent_id,
            agent_type,
            daily_limit: TokenCount::new(defaults.daily.unwrap_or(DEFAULT_DAILY_LIMIT)),
            weekly_limit: TokenCount::new(defaults.weekly.unwrap_or(DEFAULT_WEEKLY_LIMIT)),
            monthly_limit: TokenCount::new(defaults.monthly.unwrap_or(DEFAULT_MONTHLY_LIMIT)),
            daily: WindowUsage::starting_at(UsageWindow::Daily, now),
            weekly: WindowUsage::starting_at(UsageWindow::Weekly, now),
            monthly: WindowUsage::starting_at(UsageWindow::Monthly, now),
        }
    }

    /// Applies the set fields of `update`.
    pub fn apply(&mut self, update: LimitUpdate) {
        if let Some(daily) = update.daily {
            self.daily_limit = TokenCount::new(daily);
        }
        if let Some(weekly) = update.weekly {
            self.weekly_limit = TokenCount::new(weekly);
        }
        if let Some(monthly) = update.monthly {
            self.monthly_limit = TokenCount::new(monthly);
        }
    }

    pub fn limit(&self, window: UsageWindow) -> TokenCount {
        match window {
            UsageWindow::Daily => self.daily_limit,
            UsageWindow::Weekly => self.weekly_limit,
            UsageWindow::Monthly => self.monthly_limit,
        }
    }

    pub fn usage(&self, window: UsageWindow) -> &WindowUsage {
        match window {
            UsageWindow::Daily => &self.daily,
            UsageWindow::Weekly => &self.weekly,
            UsageWindow::Monthly => &self.monthly,
        }
    }

    fn usage_mut(&mut self, window: UsageWindow) -> &mut WindowUsage {
        match window {
            UsageWindow::Daily => &mut self.daily,
            UsageWindow::Weekly => &mut self.weekly,
            UsageWindow::Monthly => &mut self.monthly,
        }
    }

    pub fn used(&self, window: UsageWindow) -> TokenCount {
        self.usage(window).used
    }

    /// Percentage of the window's limit consumed; 0 when the limit is 0.
    pub fn percent_used(&self, window: UsageWindow) -> f64 {
        self.used(window).percent_of(self.limit(window))
    }

    /// Tokens left in the window before its limit.
    pub fn remaining(&self, window: UsageWindow) -> TokenCount {
        self.limit(window).saturating_sub(self.used(window))
    }

    /// Lazily resets every window whose boundary has passed.
    ///
    /// Returns the windows that were reset.
    pub fn roll_windows<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Vec<UsageWindow> {
        UsageWindow::ALL
            .into_iter()
            .filter(|window| self.usage_mut(*window).roll(*window, now))
            .collect()
    }

    /// Rolls expired windows, then adds `tokens` to every window.
    pub fn record<Tz: TimeZone>(&mut self, tokens: TokenCount, now: &DateTime<Tz>) -> Vec<UsageWindow> {
        let reset = self.roll_windows(now);
        for window in UsageWindow::ALL {
            self.usage_mut(window).used += tokens;
        }
        reset
    }

    /// Windows with a positive limit where usage is strictly above it.
    pub fn exceeded_windows(&self) -> Vec<UsageWindow> {
        UsageWindow::ALL
            .into_iter()
            .filter(|window| {
                let limit = self.limit(*window);
                !limit.is_zero() && self.used(*window) > limit
            })
            .collect()
    }
}
