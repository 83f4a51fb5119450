//! Timed checks.
//!
//! An artist with a timer gets a `check` submitted every time the timer comes
//! due. The timer is the artist's own override, falling back to
//! `scheduler.global_timer`. Ignored and completed artists are never checked
//! by the timer.
//!
//! The loop wakes every `scheduler.timer_tick`. The first time it sees an
//! artist's timer it only schedules the next run, so starting the backend
//! never triggers a burst of checks. A due artist whose previous tree is still
//! live is skipped and waits for its next run.
//!
//! # Example
//!
//! ```
//! use creator_dl::timer::CheckTimer;
//! use chrono::NaiveDate;
//!
//! let timer: CheckTimer = "weekly/0@03:00".parse().unwrap();
//! // Wednesday noon, next run is Monday 03:00
//! let now = NaiveDate::from_ymd_opt(2024, 5, 15).unwrap().and_hms_opt(12, 0, 0).unwrap();
//! let next = timer.next_run(now);
//! assert_eq!(next.to_string(), "2024-05-20 03:00:00");
//! ```

use crate::cache::ArtistCache;
use crate::error::{Error, Result};
use crate::scheduler::{Job, TaskScheduler};
use crate::types::{ArtistId, ArtistStatus, TaskHandle};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Origin recorded on task trees submitted by the timer loop
pub const TIMER_ORIGIN: &str = "timer";

/// How often a timer fires
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// Every day at `time`
    Daily,
    /// Every week on `day` (0 = Monday) at `time`
    Weekly,
    /// Every month on `day` at `time`, clamped to the month's last day
    Monthly,
}

impl TimerKind {
    fn name(&self) -> &'static str {
        match self {
            TimerKind::Daily => "daily",
            TimerKind::Weekly => "weekly",
            TimerKind::Monthly => "monthly",
        }
    }
}

/// When an artist is checked automatically, in local time
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CheckTimer {
    /// Daily, weekly or monthly
    #[serde(rename = "type")]
    pub kind: TimerKind,

    /// Time of day, `HH:MM`
    #[serde(with = "time_format")]
    #[schema(value_type = String, example = "03:00")]
    pub time: NaiveTime,

    /// Weekday for weekly timers (0 = Monday, default 0), day of month for
    /// monthly ones (default 1). Ignored by daily timers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
}

impl CheckTimer {
    /// Reject days outside the range of the timer kind
    pub fn validate(&self) -> Result<()> {
        let valid = match (self.kind, self.day) {
            (_, None) | (TimerKind::Daily, _) => true,
            (TimerKind::Weekly, Some(day)) => day <= 6,
            (TimerKind::Monthly, Some(day)) => (1..=31).contains(&day),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::Config {
                message: format!("timer day out of range for {} timer: {:?}", self.kind.name(), self.day),
                key: Some("timer.day".into()),
            })
        }
    }

    /// First run strictly after `from`
    pub fn next_run(&self, from: NaiveDateTime) -> NaiveDateTime {
        let at = |date: NaiveDate| date.and_time(self.time);

        match self.kind {
            TimerKind::Daily => {
                let today = at(from.date());
                if today > from {
                    today
                } else {
                    today + TimeDelta::days(1)
                }
            }
            TimerKind::Weekly => {
                let wanted = self.day.unwrap_or(0).min(6);
                let current = from.weekday().num_days_from_monday();
                let ahead = (wanted + 7 - current) % 7;
                let candidate = at(from.date() + TimeDelta::days(i64::from(ahead)));
                if candidate > from {
                    candidate
                } else {
                    candidate + TimeDelta::days(7)
                }
            }
            TimerKind::Monthly => {
                let day = self.day.unwrap_or(1);
                let candidate = at(month_day(from.year(), from.month(), day));
                if candidate > from {
                    return candidate;
                }
                let (year, month) = if from.month() == 12 {
                    (from.year() + 1, 1)
                } else {
                    (from.year(), from.month() + 1)
                };
                at(month_day(year, month, day))
            }
        }
    }
}

/// `day` of the month, or the month's last day when it is shorter
fn month_day(year: i32, month: u32, day: u32) -> NaiveDate {
    (1..=day.clamp(1, 31))
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
        .unwrap_or(NaiveDate::MIN)
}

/// `daily@HH:MM`, `weekly/D@HH:MM` or `monthly/D@HH:MM`
impl std::str::FromStr for CheckTimer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (schedule, time) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| "expected <kind>[/<day>]@HH:MM".to_string())?;
        let time = NaiveTime::parse_from_str(time, "%H:%M")
            .map_err(|_| format!("invalid time of day: {}", time))?;

        let (kind, day) = match schedule.split_once('/') {
            Some((kind, day)) => {
                let day = day
                    .parse::<u32>()
                    .map_err(|_| format!("invalid day: {}", day))?;
                (kind, Some(day))
            }
            None => (schedule, None),
        };
        let kind = match kind {
            "daily" => TimerKind::Daily,
            "weekly" => TimerKind::Weekly,
            "monthly" => TimerKind::Monthly,
            other => return Err(format!("unknown timer kind: {}", other)),
        };

        let timer = CheckTimer { kind, time, day };
        timer.validate().map_err(|e| e.to_string())?;
        Ok(timer)
    }
}

impl std::fmt::Display for CheckTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind.name())?;
        if let Some(day) = self.day {
            write!(f, "/{}", day)?;
        }
        write!(f, "@{}", self.time.format("%H:%M"))
    }
}

/// Background loop that submits timed checks
pub struct TimerTask {
    scheduler: TaskScheduler,
    cache: Arc<ArtistCache>,
    global: Option<CheckTimer>,
    /// Next run per artist, with the timer it was computed from
    next_runs: HashMap<ArtistId, (CheckTimer, NaiveDateTime)>,
}

impl TimerTask {
    /// Create a timer loop over the shared scheduler and cache
    pub fn new(scheduler: TaskScheduler, cache: Arc<ArtistCache>, global: Option<CheckTimer>) -> Self {
        Self {
            scheduler,
            cache,
            global,
            next_runs: HashMap::new(),
        }
    }

    /// Next scheduled run of an artist, once the loop has seen its timer
    pub fn next_run_of(&self, artist_id: &ArtistId) -> Option<NaiveDateTime> {
        self.next_runs.get(artist_id).map(|(_, next)| *next)
    }

    /// Submit a check for every artist whose timer is due at `now`
    pub async fn tick(&mut self, now: NaiveDateTime) -> Vec<TaskHandle> {
        let mut submitted = Vec::new();
        let mut seen = HashSet::new();

        for summary in self.cache.list().await {
            if summary.status != ArtistStatus::Active {
                continue;
            }
            let id = summary.id;
            let timer = match self.cache.overrides(&id).await.timer {
                Some(timer) => timer,
                None => match &self.global {
                    Some(timer) => timer.clone(),
                    None => continue,
                },
            };
            seen.insert(id.clone());

            // A new or edited timer only schedules its first run
            let due = match self.next_runs.get(&id) {
                Some((known, next)) if *known == timer => now >= *next,
                _ => false,
            };
            if !due {
                if self.next_runs.get(&id).is_none_or(|(known, _)| *known != timer) {
                    let next = timer.next_run(now);
                    tracing::debug!(artist_id = %id, timer = %timer, next_run = %next, "Timer scheduled");
                    self.next_runs.insert(id, (timer, next));
                }
                continue;
            }

            let next = timer.next_run(now);
            self.next_runs.insert(id.clone(), (timer, next));

            if self.scheduler.has_live_tree(&id) {
                tracing::info!(artist_id = %id, next_run = %next, "Timed check skipped, a tree is still live");
                continue;
            }
            match self.scheduler.submit(&id, Job::Check, TIMER_ORIGIN).await {
                Ok(handle) => {
                    tracing::info!(artist_id = %id, task_id = handle.id.0, next_run = %next, "Timed check queued");
                    submitted.push(handle);
                }
                Err(e) => tracing::warn!(artist_id = %id, error = %e, "Timed check not queued"),
            }
        }

        self.next_runs.retain(|id, _| seen.contains(id));
        submitted
    }

    /// Tick every `interval` until `token` is cancelled or the scheduler stops accepting work
    pub async fn run(mut self, interval: Duration, token: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "Timer task started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.scheduler.is_accepting() {
                        break;
                    }
                    self.tick(Local::now().naive_local()).await;
                }
            }
        }
        tracing::info!("Timer task stopped");
    }
}

mod time_format {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
