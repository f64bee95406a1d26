//! Recurring test scheduling
//!
//! Expands each schedule's cadence and hour-of-day boundaries into
//! concrete next-due instants, enqueues jobs as they come due, and
//! re-derives the trigger set when configuration changes (explicit
//! reset flag) or on the periodic refresh. Also hosts the daily
//! maintenance trigger that prunes old results.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use awt_common::db::models::{Cadence, JobCause, TestSchedule};
use awt_common::db::{jobs, results, settings, tests as db_tests};
use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, Timelike};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::state::SharedState;

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(10);
/// Triggers are re-derived from configuration at least this often even
/// without an explicit reset.
const REFRESH_EVERY: Duration = Duration::hours(1);
/// Results retention runs once a day, off the busy hour boundaries.
const MAINTENANCE_TIME: (u32, u32) = (22, 9);

/// One armed trigger: a test due at `next_due`, recurring per cadence.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub test_name: String,
    pub cadence: Cadence,
    pub hour: NaiveTime,
    pub next_due: DateTime<Local>,
}

/// First occurrence of `hour` strictly after `after`, honoring the
/// cadence. `EveryNDays` anchors its period on the derivation instant,
/// advancing in whole days from the first occurrence.
pub fn next_occurrence(
    cadence: Cadence,
    hour: NaiveTime,
    after: DateTime<Local>,
) -> Option<DateTime<Local>> {
    let at_hour = |date: chrono::NaiveDate| -> Option<DateTime<Local>> {
        date.and_time(hour).and_local_timezone(Local).single()
    };
    let today = after.date_naive();
    match cadence {
        Cadence::Never => None,
        Cadence::Everyday | Cadence::EveryNDays(_) => {
            let candidate = at_hour(today)?;
            if candidate > after {
                Some(candidate)
            } else {
                at_hour(today.succ_opt()?)
            }
        }
        Cadence::Weekday(weekday) => {
            let mut date = today;
            for _ in 0..8 {
                if date.weekday() == weekday {
                    if let Some(candidate) = at_hour(date) {
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                }
                date = date.succ_opt()?;
            }
            None
        }
    }
}

/// Advance a fired trigger to its next occurrence.
pub fn advance(trigger: &Trigger, now: DateTime<Local>) -> Option<DateTime<Local>> {
    match trigger.cadence {
        Cadence::Never => None,
        Cadence::Everyday => next_occurrence(trigger.cadence, trigger.hour, now),
        Cadence::EveryNDays(n) => Some(trigger.next_due + Duration::days(n as i64)),
        Cadence::Weekday(_) => Some(trigger.next_due + Duration::weeks(1)),
    }
}

/// Build the trigger set from the stored schedules.
pub fn derive_triggers(schedules: &[TestSchedule], now: DateTime<Local>) -> Vec<Trigger> {
    let mut triggers = Vec::new();
    for schedule in schedules.iter().filter(|s| s.enabled) {
        let cadence = schedule.cadence();
        if cadence == Cadence::Never {
            info!("Days to run for {} was Never", schedule.test_name);
            continue;
        }
        for hour_text in &schedule.hours {
            let Ok(hour) = NaiveTime::parse_from_str(hour_text, "%H:%M") else {
                warn!(
                    "Schedule for {} has unparseable hour {hour_text}",
                    schedule.test_name
                );
                continue;
            };
            if let Some(next_due) = next_occurrence(cadence, hour, now) {
                info!(
                    "Adding schedule for {} at {hour_text}, first due {next_due}",
                    schedule.test_name
                );
                triggers.push(Trigger {
                    test_name: schedule.test_name.clone(),
                    cadence,
                    hour,
                    next_due,
                });
            }
        }
    }
    triggers
}

/// Long-running scheduler task.
pub async fn run_scheduler(db: SqlitePool, state: Arc<SharedState>) {
    let mut triggers = reload(&db).await;
    let mut last_refresh = Local::now();
    let mut last_maintenance_day: Option<chrono::NaiveDate> = None;

    loop {
        tokio::time::sleep(TICK_INTERVAL).await;
        let now = Local::now();

        if state.take_schedule_reset() || now - last_refresh >= REFRESH_EVERY {
            triggers = reload(&db).await;
            last_refresh = now;
        }

        for trigger in triggers.iter_mut() {
            if trigger.next_due > now {
                continue;
            }
            info!("Schedule fired for {}", trigger.test_name);
            if let Err(e) = jobs::enqueue(&db, &trigger.test_name, JobCause::Scheduled).await {
                error!("Could not enqueue scheduled job {}: {e}", trigger.test_name);
            }
            match advance(trigger, now) {
                Some(next) => trigger.next_due = next,
                None => trigger.next_due = now + Duration::days(3650),
            }
        }

        // Daily maintenance: prune results past retention.
        let due_today = now.hour() == MAINTENANCE_TIME.0 && now.minute() >= MAINTENANCE_TIME.1;
        if due_today && last_maintenance_day != Some(now.date_naive()) {
            last_maintenance_day = Some(now.date_naive());
            run_maintenance(&db).await;
        }
    }
}

async fn reload(db: &SqlitePool) -> Vec<Trigger> {
    match db_tests::all_schedules(db).await {
        Ok(schedules) => derive_triggers(&schedules, Local::now()),
        Err(e) => {
            error!("Could not load schedules: {e}");
            Vec::new()
        }
    }
}

async fn run_maintenance(db: &SqlitePool) {
    let days = settings::get_setting::<i64>(db, "days_of_results_to_keep")
        .await
        .ok()
        .flatten()
        .unwrap_or(100);
    match results::prune_older_than(db, days).await {
        Ok(removed) if removed > 0 => info!("Pruned {removed} results older than {days} days"),
        Ok(_) => {}
        Err(e) => error!("Result pruning failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn everyday_picks_today_when_hour_is_ahead() {
        let now = local(2026, 3, 10, 8, 0);
        let hour = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let due = next_occurrence(Cadence::Everyday, hour, now).unwrap();
        assert_eq!(due, local(2026, 3, 10, 9, 30));
    }

    #[test]
    fn everyday_rolls_to_tomorrow_when_hour_passed() {
        let now = local(2026, 3, 10, 10, 0);
        let hour = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let due = next_occurrence(Cadence::Everyday, hour, now).unwrap();
        assert_eq!(due, local(2026, 3, 11, 9, 30));
    }

    #[test]
    fn weekday_lands_on_the_named_day() {
        // 2026-03-10 is a Tuesday
        let now = local(2026, 3, 10, 12, 0);
        let hour = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let due = next_occurrence(Cadence::Weekday(chrono::Weekday::Fri), hour, now).unwrap();
        assert_eq!(due, local(2026, 3, 13, 7, 0));
        assert_eq!(due.weekday(), chrono::Weekday::Fri);

        // Same weekday with the hour already past rolls a full week
        let tue_late = next_occurrence(
            Cadence::Weekday(chrono::Weekday::Tue),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            now,
        )
        .unwrap();
        assert_eq!(tue_late, local(2026, 3, 17, 7, 0));
    }

    #[test]
    fn every_n_days_advances_in_whole_days() {
        let hour = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let trigger = Trigger {
            test_name: "KH".into(),
            cadence: Cadence::EveryNDays(3),
            hour,
            next_due: local(2026, 3, 10, 6, 0),
        };
        let next = advance(&trigger, local(2026, 3, 10, 6, 1)).unwrap();
        assert_eq!(next, local(2026, 3, 13, 6, 0));
    }

    #[test]
    fn never_produces_no_trigger() {
        let schedules = vec![TestSchedule {
            test_name: "PH".into(),
            enabled: true,
            days_to_run: "Never".into(),
            hours: vec!["09:00".into()],
        }];
        assert!(derive_triggers(&schedules, Local::now()).is_empty());
    }

    #[test]
    fn disabled_schedules_are_ignored() {
        let schedules = vec![TestSchedule {
            test_name: "PH".into(),
            enabled: false,
            days_to_run: "Everyday".into(),
            hours: vec!["09:00".into()],
        }];
        assert!(derive_triggers(&schedules, Local::now()).is_empty());
    }

    #[test]
    fn one_trigger_per_hour_boundary() {
        let schedules = vec![TestSchedule {
            test_name: "NO3".into(),
            enabled: true,
            days_to_run: "Everyday".into(),
            hours: vec!["06:00".into(), "18:00".into()],
        }];
        let triggers = derive_triggers(&schedules, Local::now());
        assert_eq!(triggers.len(), 2);
    }
}
