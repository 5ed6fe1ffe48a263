use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use due_sync_core::{Clock, OverageOrigin, SyncError};
use parking_lot::Mutex;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, Time, UtcOffset};
use tracing::{debug, warn};

use crate::transport::HttpResponse;

/// Application code the registry returns, with HTTP 200, once the hourly
/// quota is blown.
pub const QUOTA_EXCEEDED_CODE: &str = "PUCX-ER1001";

const WINDOW: Duration = Duration::HOUR;

/// Period during which no outbound call may be attempted.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CooldownWindow {
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub unblock_at: OffsetDateTime,
}

impl CooldownWindow {
    const INACTIVE: Self = Self { active: false, unblock_at: OffsetDateTime::UNIX_EPOCH };

    /// Enter or lengthen the window. An active window is never shortened.
    fn extend(&mut self, until: OffsetDateTime) {
        if !self.active || until > self.unblock_at {
            self.unblock_at = until;
        }
        self.active = true;
    }

    fn expire(&mut self, now: OffsetDateTime) {
        if self.active && now >= self.unblock_at {
            self.active = false;
        }
    }
}

/// Point-in-time view of the governor for reports and status commands.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GovernorSnapshot {
    pub budget: u32,
    pub admitted_last_hour: usize,
    pub remaining: usize,
    pub total_admitted: u64,
    pub violations: u32,
    pub cooldown: CooldownWindow,
}

#[derive(Debug)]
struct GovernorState {
    admitted: VecDeque<OffsetDateTime>,
    cooldown: CooldownWindow,
    violations: u32,
    total_admitted: u64,
}

impl GovernorState {
    fn prune(&mut self, now: OffsetDateTime) {
        while self.admitted.front().is_some_and(|at| *at <= now - WINDOW) {
            self.admitted.pop_front();
        }
    }
}

/// Process-wide gate in front of every outbound call, logins included.
///
/// Keeps a rolling one-hour record of admitted calls capped below the
/// upstream quota, and a cooldown window entered when the budget is spent
/// or the upstream reports an overage. While the window is active every
/// admission fails fast with the unblock instant.
pub struct RateGovernor {
    clock: Arc<dyn Clock>,
    budget: u32,
    upstream_offset: UtcOffset,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    #[must_use]
    pub fn new(budget: u32, upstream_offset: UtcOffset, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            budget,
            upstream_offset,
            state: Mutex::new(GovernorState {
                admitted: VecDeque::new(),
                cooldown: CooldownWindow::INACTIVE,
                violations: 0,
                total_admitted: 0,
            }),
        }
    }

    /// Reserve one call slot.
    ///
    /// # Errors
    /// Returns [`SyncError::RateLimitExceeded`] while a cooldown is active or
    /// when the rolling budget is spent; the latter also starts a cooldown
    /// lasting until the oldest admission leaves the window.
    pub fn admit(&self) -> Result<(), SyncError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.cooldown.expire(now);
        if state.cooldown.active {
            return Err(SyncError::RateLimitExceeded {
                retry_at: state.cooldown.unblock_at,
                origin: OverageOrigin::Cooldown,
            });
        }

        state.prune(now);
        let budget = usize::try_from(self.budget).unwrap_or(usize::MAX);
        if state.admitted.len() >= budget {
            let retry_at = state.admitted.front().map_or(now + WINDOW, |oldest| *oldest + WINDOW);
            state.cooldown.extend(retry_at);
            warn!(budget = self.budget, %retry_at, "local request budget exhausted");
            return Err(SyncError::RateLimitExceeded {
                retry_at: state.cooldown.unblock_at,
                origin: OverageOrigin::LocalBudget,
            });
        }

        state.admitted.push_back(now);
        state.total_admitted += 1;
        Ok(())
    }

    /// Inspect a response for an upstream overage signal.
    ///
    /// # Errors
    /// Returns [`SyncError::RateLimitExceeded`] for HTTP 429 and for a 200 body
    /// carrying [`QUOTA_EXCEEDED_CODE`]; the cooldown is extended first.
    pub fn inspect(&self, response: &HttpResponse) -> Result<(), SyncError> {
        let now = self.clock.now();
        if response.status == 429 {
            let hinted = response
                .header("retry-after")
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .filter(|secs| *secs > 0)
                .map(|secs| now + Duration::seconds(secs))
                .or_else(|| {
                    quota_message(&response.body)
                        .and_then(|message| parse_unblock_hint(&message, now, self.upstream_offset))
                });
            return Err(self.signal(now, hinted, OverageOrigin::TooManyRequests));
        }

        if response.status == 200 && response.body.contains(QUOTA_EXCEEDED_CODE) {
            if let Some(message) = quota_message(&response.body) {
                let hinted = parse_unblock_hint(&message, now, self.upstream_offset);
                return Err(self.signal(now, hinted, OverageOrigin::QuotaExceeded));
            }
        }
        Ok(())
    }

    fn signal(
        &self,
        now: OffsetDateTime,
        hinted: Option<OffsetDateTime>,
        origin: OverageOrigin,
    ) -> SyncError {
        let unblock_at = hinted.unwrap_or_else(|| next_top_of_hour(now));
        let mut state = self.state.lock();
        state.violations = state.violations.saturating_add(1);
        state.cooldown.extend(unblock_at);
        warn!(
            %origin,
            violations = state.violations,
            unblock_at = %state.cooldown.unblock_at,
            expected_penalty_until = %penalty_until(state.violations, now),
            "upstream reported quota overage; entering cooldown"
        );
        SyncError::RateLimitExceeded { retry_at: state.cooldown.unblock_at, origin }
    }

    /// Current cooldown, expired windows reported as inactive.
    #[must_use]
    pub fn cooldown(&self) -> CooldownWindow {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.cooldown.expire(now);
        state.cooldown
    }

    #[must_use]
    pub fn snapshot(&self) -> GovernorSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.cooldown.expire(now);
        state.prune(now);
        let budget = usize::try_from(self.budget).unwrap_or(usize::MAX);
        GovernorSnapshot {
            budget: self.budget,
            admitted_last_hour: state.admitted.len(),
            remaining: budget.saturating_sub(state.admitted.len()),
            total_admitted: state.total_admitted,
            violations: state.violations,
            cooldown: state.cooldown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuotaBody {
    code: Option<String>,
    message: Option<String>,
}

/// Message of a quota-exceeded body, if the body is one.
fn quota_message(body: &str) -> Option<String> {
    let parsed: QuotaBody = serde_json::from_str(body).ok()?;
    if parsed.code.as_deref() != Some(QUOTA_EXCEEDED_CODE) {
        return None;
    }
    debug!(message = ?parsed.message, "quota-exceeded body received");
    Some(parsed.message.unwrap_or_default())
}

fn hint_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(?:após\s+as|apos\s+as|again\s+at|after)\s+(\d{1,2}):(\d{2})(?::(\d{2}))?",
            )
            .ok()
        })
        .as_ref()
}

/// Unblock instant from a wall-clock time embedded in an upstream message.
///
/// The time is read in the upstream's offset; one already past rolls over to
/// the next day. Returns `None` when the message carries no usable time.
#[must_use]
pub fn parse_unblock_hint(
    message: &str,
    now: OffsetDateTime,
    upstream_offset: UtcOffset,
) -> Option<OffsetDateTime> {
    let captures = hint_pattern()?.captures(message)?;
    let field = |index: usize| -> Option<u8> {
        captures.get(index).map_or(Some(0), |value| value.as_str().parse().ok())
    };
    let at = Time::from_hms(field(1)?, field(2)?, field(3)?).ok()?;

    let local_now = now.to_offset(upstream_offset);
    let candidate = local_now.replace_time(at);
    let candidate = if candidate <= local_now { candidate + Duration::DAY } else { candidate };
    Some(candidate.to_offset(UtcOffset::UTC))
}

#[must_use]
pub fn next_top_of_hour(now: OffsetDateTime) -> OffsetDateTime {
    let into_hour = Duration::minutes(i64::from(now.minute()))
        + Duration::seconds(i64::from(now.second()))
        + Duration::nanoseconds(i64::from(now.nanosecond()));
    now - into_hour + Duration::HOUR
}

/// Upstream penalty escalation: first overage blocks until the end of the
/// hour, the second one hour beyond that, later ones two hours beyond.
#[must_use]
pub fn penalty_until(violations: u32, now: OffsetDateTime) -> OffsetDateTime {
    let end_of_hour = next_top_of_hour(now);
    match violations {
        0 | 1 => end_of_hour,
        2 => end_of_hour + Duration::HOUR,
        _ => end_of_hour + Duration::hours(2),
    }
}
