use crate::errors::{AppError, AppResult};
use crate::models::{
    DashboardSnapshot, ReportFormat, ReportFrequency, ReportRecipient, ReportSchedule,
    ScheduledReport,
};
use chrono::{
    DateTime, Datelike, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};
use chrono_tz::Tz;

// The engine decides when to send and with what payload; the dispatcher
// owns rendering and transport.
pub trait ReportDispatcher: Send + Sync {
    fn dispatch(
        &self,
        snapshot: &DashboardSnapshot,
        format: ReportFormat,
        recipients: &[ReportRecipient],
    ) -> AppResult<()>;
}

pub fn validate_schedule(schedule: &ReportSchedule) -> AppResult<()> {
    schedule
        .timezone
        .parse::<Tz>()
        .map_err(|_| AppError::Validation(format!("Unknown timezone: {}", schedule.timezone)))?;
    parse_time_of_day(&schedule.time).ok_or_else(|| {
        AppError::Validation(format!("Invalid time of day: {:?}", schedule.time))
    })?;

    match schedule.frequency {
        ReportFrequency::Weekly => {
            match schedule.day_of_week {
                Some(day) if day <= 6 => {}
                Some(day) => {
                    return Err(AppError::Validation(format!(
                        "dayOfWeek must be 0-6, got {day}"
                    )))
                }
                None => {
                    return Err(AppError::Validation(
                        "Weekly schedules require dayOfWeek".to_string(),
                    ))
                }
            }
            if schedule.day_of_month.is_some() {
                return Err(AppError::Validation(
                    "dayOfMonth is only valid for monthly and quarterly schedules".to_string(),
                ));
            }
        }
        ReportFrequency::Monthly | ReportFrequency::Quarterly => {
            match schedule.day_of_month {
                Some(day) if (1..=31).contains(&day) => {}
                Some(day) => {
                    return Err(AppError::Validation(format!(
                        "dayOfMonth must be 1-31, got {day}"
                    )))
                }
                None => {
                    return Err(AppError::Validation(format!(
                        "{} schedules require dayOfMonth",
                        schedule.frequency.as_str()
                    )))
                }
            }
            if schedule.day_of_week.is_some() {
                return Err(AppError::Validation(
                    "dayOfWeek is only valid for weekly schedules".to_string(),
                ));
            }
        }
        ReportFrequency::Daily => {
            if schedule.day_of_week.is_some() || schedule.day_of_month.is_some() {
                return Err(AppError::Validation(
                    "Daily schedules take neither dayOfWeek nor dayOfMonth".to_string(),
                ));
            }
        }
    }
    Ok(())
}

// Next dispatch instant strictly after `from`. Wall-clock arithmetic happens
// in the schedule's timezone, materialized as UTC.
pub fn compute_next(schedule: &ReportSchedule, from: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    validate_schedule(schedule)?;
    let tz: Tz = schedule
        .timezone
        .parse()
        .map_err(|_| AppError::Validation(format!("Unknown timezone: {}", schedule.timezone)))?;
    let (hour, minute) = parse_time_of_day(&schedule.time)
        .ok_or_else(|| AppError::Validation(format!("Invalid time of day: {:?}", schedule.time)))?;

    let local_now = from.with_timezone(&tz).naive_local();
    let today = local_now.date();
    let time_of_day = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| AppError::Validation(format!("Invalid time of day: {:?}", schedule.time)))?;

    let target_date = match schedule.frequency {
        ReportFrequency::Daily => {
            if NaiveDateTime::new(today, time_of_day) > local_now {
                today
            } else {
                today + Duration::days(1)
            }
        }
        ReportFrequency::Weekly => {
            let target = u32::from(schedule.day_of_week.unwrap_or(0));
            let current = today.weekday().num_days_from_sunday();
            let mut days_ahead = (target + 7 - current) % 7;
            // Today's occurrence already passed: roll a full week.
            if days_ahead == 0 && NaiveDateTime::new(today, time_of_day) <= local_now {
                days_ahead = 7;
            }
            today + Duration::days(i64::from(days_ahead))
        }
        ReportFrequency::Monthly => {
            clamped_day_in_offset_month(today, schedule.day_of_month.unwrap_or(1), 1)
        }
        ReportFrequency::Quarterly => {
            clamped_day_in_offset_month(today, schedule.day_of_month.unwrap_or(1), 3)
        }
    };

    Ok(resolve_local(tz, NaiveDateTime::new(target_date, time_of_day)))
}

// next_send_at advances on failure too: a failed occurrence is skipped,
// never retried early.
pub fn apply_dispatch_outcome(
    report: &mut ScheduledReport,
    outcome: Result<(), String>,
    now: DateTime<Utc>,
) -> AppResult<()> {
    match outcome {
        Ok(()) => {
            report.last_sent_at = Some(now);
            report.error_count = 0;
            report.last_error = None;
        }
        Err(message) => {
            report.error_count += 1;
            report.last_error = Some(message);
        }
    }
    report.next_send_at = compute_next(&report.schedule, now)?;
    report.updated_at = now;
    Ok(())
}

pub fn parse_time_of_day(raw: &str) -> Option<(u32, u32)> {
    let (hour, minute) = raw.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn clamped_day_in_offset_month(today: NaiveDate, day_of_month: u8, months_ahead: u32) -> NaiveDate {
    let anchor = today.with_day(1).unwrap_or(today);
    let target_month = anchor
        .checked_add_months(Months::new(months_ahead))
        .unwrap_or(anchor);
    let last_day = days_in_month(target_month.year(), target_month.month());
    let day = u32::from(day_of_month).min(last_day);
    target_month.with_day(day).unwrap_or(target_month)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(instant) => instant.with_timezone(&Utc),
        // Fall-back overlap: take the earlier of the two wall clocks.
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Spring-forward gap: the wall-clock time does not exist, shift an
        // hour forward into the new offset.
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|instant| instant.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(
        frequency: ReportFrequency,
        day_of_week: Option<u8>,
        day_of_month: Option<u8>,
        time: &str,
        timezone: &str,
    ) -> ReportSchedule {
        ReportSchedule {
            frequency,
            day_of_week,
            day_of_month,
            time: time.to_string(),
            timezone: timezone.to_string(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("instant")
    }

    #[test]
    fn daily_rolls_to_tomorrow_once_time_has_passed() {
        let spec = schedule(ReportFrequency::Daily, None, None, "09:00", "UTC");
        // 2026-08-27 is a Thursday.
        let before = compute_next(&spec, utc(2026, 8, 27, 8, 0)).expect("next");
        assert_eq!(before, utc(2026, 8, 27, 9, 0));
        let after = compute_next(&spec, utc(2026, 8, 27, 10, 0)).expect("next");
        assert_eq!(after, utc(2026, 8, 28, 9, 0));
    }

    #[test]
    fn weekly_past_occurrence_rolls_a_full_week() {
        // dayOfWeek 1 = Monday; 2026-08-24 is a Monday.
        let spec = schedule(ReportFrequency::Weekly, Some(1), None, "09:00", "UTC");
        let next = compute_next(&spec, utc(2026, 8, 24, 10, 0)).expect("next");
        assert_eq!(next, utc(2026, 8, 31, 9, 0));
    }

    #[test]
    fn weekly_same_day_before_time_fires_today() {
        let spec = schedule(ReportFrequency::Weekly, Some(1), None, "09:00", "UTC");
        let next = compute_next(&spec, utc(2026, 8, 24, 8, 0)).expect("next");
        assert_eq!(next, utc(2026, 8, 24, 9, 0));
    }

    #[test]
    fn monthly_day_31_clamps_to_end_of_february() {
        let spec = schedule(ReportFrequency::Monthly, None, Some(31), "08:00", "UTC");
        let non_leap = compute_next(&spec, utc(2026, 1, 15, 12, 0)).expect("next");
        assert_eq!(non_leap, utc(2026, 2, 28, 8, 0));
        let leap = compute_next(&spec, utc(2028, 1, 15, 12, 0)).expect("next");
        assert_eq!(leap, utc(2028, 2, 29, 8, 0));
    }

    #[test]
    fn quarterly_advances_three_months_with_clamping() {
        let spec = schedule(ReportFrequency::Quarterly, None, Some(31), "08:00", "UTC");
        let next = compute_next(&spec, utc(2026, 1, 15, 12, 0)).expect("next");
        assert_eq!(next, utc(2026, 4, 30, 8, 0));
    }

    #[test]
    fn wall_clock_time_respects_the_schedule_timezone() {
        let spec = schedule(ReportFrequency::Daily, None, None, "09:00", "America/New_York");
        // August: EDT, UTC-4. 09:00 local = 13:00 UTC.
        let next = compute_next(&spec, utc(2026, 8, 27, 0, 0)).expect("next");
        assert_eq!(next, utc(2026, 8, 27, 13, 0));
        // January: EST, UTC-5. 09:00 local = 14:00 UTC.
        let winter = compute_next(&spec, utc(2026, 1, 10, 0, 0)).expect("next");
        assert_eq!(winter, utc(2026, 1, 10, 14, 0));
    }

    #[test]
    fn frequency_field_invariants_are_enforced() {
        let missing_dow = schedule(ReportFrequency::Weekly, None, None, "09:00", "UTC");
        assert!(matches!(
            validate_schedule(&missing_dow),
            Err(AppError::Validation(_))
        ));

        let stray_dom = schedule(ReportFrequency::Weekly, Some(1), Some(15), "09:00", "UTC");
        assert!(validate_schedule(&stray_dom).is_err());

        let missing_dom = schedule(ReportFrequency::Monthly, None, None, "09:00", "UTC");
        assert!(validate_schedule(&missing_dom).is_err());

        let daily_extra = schedule(ReportFrequency::Daily, Some(1), None, "09:00", "UTC");
        assert!(validate_schedule(&daily_extra).is_err());

        let bad_tz = schedule(ReportFrequency::Daily, None, None, "09:00", "Mars/Olympus");
        assert!(validate_schedule(&bad_tz).is_err());

        let bad_time = schedule(ReportFrequency::Daily, None, None, "25:00", "UTC");
        assert!(validate_schedule(&bad_time).is_err());
    }

    #[test]
    fn dispatch_outcome_bookkeeping() {
        let spec = schedule(ReportFrequency::Daily, None, None, "09:00", "UTC");
        let created = utc(2026, 8, 1, 0, 0);
        let mut report = ScheduledReport {
            id: "rep-1".to_string(),
            dashboard_id: "dash-1".to_string(),
            schedule: spec,
            recipients: Vec::new(),
            format: ReportFormat::Pdf,
            is_active: true,
            last_sent_at: None,
            next_send_at: utc(2026, 8, 27, 9, 0),
            error_count: 2,
            last_error: Some("smtp timeout".to_string()),
            created_at: created,
            updated_at: created,
        };

        let now = utc(2026, 8, 27, 9, 1);
        apply_dispatch_outcome(&mut report, Ok(()), now).expect("apply success");
        assert_eq!(report.error_count, 0);
        assert_eq!(report.last_sent_at, Some(now));
        assert!(report.last_error.is_none());
        assert_eq!(report.next_send_at, utc(2026, 8, 28, 9, 0));

        let later = utc(2026, 8, 28, 9, 1);
        apply_dispatch_outcome(&mut report, Err("render failed".to_string()), later)
            .expect("apply failure");
        assert_eq!(report.error_count, 1);
        assert_eq!(report.last_error.as_deref(), Some("render failed"));
        // Failure still advances the schedule.
        assert_eq!(report.next_send_at, utc(2026, 8, 29, 9, 0));
        // Success timestamp untouched by the failure.
        assert_eq!(report.last_sent_at, Some(now));
    }
}
