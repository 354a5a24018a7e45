//! Business-hours arithmetic used for escalation deadlines.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

pub const OPENING_HOUR: u32 = 10;
pub const CLOSING_HOUR: u32 = 18;

/// Weekday, local-timezone business hours: `[OPENING_HOUR, CLOSING_HOUR)`,
/// Monday through Friday.
pub fn during_business_hours(time: DateTime<Utc>, tz: Tz) -> bool {
    let local = time.with_timezone(&tz);
    let hour = local.hour();
    let weekday = local.weekday().number_from_monday(); // 1..=7
    (OPENING_HOUR..CLOSING_HOUR).contains(&hour) && (1..=5).contains(&weekday)
}

/// Computes an expiration time for an alert. `start + ttl`, rolled forward to
/// the next business morning at `OPENING_HOUR` if it would otherwise land
/// outside business hours, advancing a day at a time until a weekday is hit.
///
/// `ttl` may be negative (used by tests to force immediate expiry); the
/// rollover logic is unaffected either way since it only triggers when the
/// computed `end` falls outside business hours.
pub fn get_expiration_time(start: DateTime<Utc>, ttl: Duration, tz: Tz) -> DateTime<Utc> {
    let end = start + ttl;
    if during_business_hours(end, tz) {
        return end;
    }

    let local_start = start.with_timezone(&tz);
    let end_of_day = tz
        .with_ymd_and_hms(
            local_start.year(),
            local_start.month(),
            local_start.day(),
            CLOSING_HOUR,
            0,
            0,
        )
        .single()
        .expect("closing hour is an unambiguous local time");

    let delta = end - end_of_day.with_timezone(&Utc);
    let mut next_day = end_of_day + Duration::hours(((OPENING_HOUR as i64 - CLOSING_HOUR as i64).rem_euclid(24)));

    while !during_business_hours(next_day.with_timezone(&Utc), tz) {
        next_day += Duration::days(1);
    }

    next_day.with_timezone(&Utc) + delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn la() -> Tz {
        chrono_tz::America::Los_Angeles
    }

    #[test]
    fn within_business_hours_is_unchanged() {
        // Wednesday 2024-01-03 11:00 PT
        let start = la().with_ymd_and_hms(2024, 1, 3, 11, 0, 0).unwrap().with_timezone(&Utc);
        let end = get_expiration_time(start, Duration::hours(2), la());
        assert_eq!(end, start + Duration::hours(2));
    }

    #[test]
    fn rolls_past_closing_to_next_morning() {
        // Wednesday 2024-01-03 17:30 PT + 2h = 19:30, past closing.
        let start = la().with_ymd_and_hms(2024, 1, 3, 17, 30, 0).unwrap().with_timezone(&Utc);
        let end = get_expiration_time(start, Duration::hours(2), la());
        let local = end.with_timezone(&la());
        assert_eq!(local.hour(), 11); // 1h30m past opening (10:00 + 1:30)
        assert_eq!(local.day(), 4);
    }

    #[test]
    fn rolls_over_weekend_to_monday() {
        // Friday 2024-01-05 17:00 PT + 2h would land Saturday — must roll to Monday.
        let start = la().with_ymd_and_hms(2024, 1, 5, 17, 0, 0).unwrap().with_timezone(&Utc);
        let end = get_expiration_time(start, Duration::hours(2), la());
        let local = end.with_timezone(&la());
        assert_eq!(local.weekday().number_from_monday(), 1); // Monday
        assert_eq!(local.hour(), 11);
    }

    #[test]
    fn always_satisfies_business_hours() {
        let start = Utc::now();
        for hours in [-1i64, 0, 1, 5, 9, 30, 100] {
            let end = get_expiration_time(start, Duration::hours(hours), la());
            assert!(during_business_hours(end, la()), "failed for offset {hours}h");
        }
    }
}
