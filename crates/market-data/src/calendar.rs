use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::US::Eastern;
use trading_core::MarketClosedReason;

/// US equity market calendar (NYSE/Nasdaq holidays, America/New_York time).
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketCalendar {
    session_hours_only: bool,
}

impl MarketCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat times outside 09:30-16:00 ET as closed.
    pub fn with_session_hours(mut self, enabled: bool) -> Self {
        self.session_hours_only = enabled;
        self
    }

    /// `Ok(())` when the market trades at `at`, otherwise why it does not.
    pub fn check(&self, at: DateTime<Utc>) -> Result<(), MarketClosedReason> {
        let local = at.with_timezone(&Eastern);
        let date = local.date_naive();

        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(MarketClosedReason::Weekend);
        }
        if let Some(name) = holiday_on(date) {
            return Err(MarketClosedReason::Holiday(name));
        }

        if self.session_hours_only {
            let minutes = local.hour() * 60 + local.minute();
            let regular_open = 9 * 60 + 30;
            let regular_close = 16 * 60;
            if minutes < regular_open || minutes >= regular_close {
                return Err(MarketClosedReason::OutsideSession);
            }
        }

        Ok(())
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        self.check(at).is_ok()
    }
}

/// Name of the market holiday observed on `date`, if any.
pub fn holiday_on(date: NaiveDate) -> Option<&'static str> {
    holidays(date.year())
        .into_iter()
        .find(|(day, _)| *day == date)
        .map(|(_, name)| name)
}

/// The ten full-day market holidays for `year`, on their observed dates.
pub fn holidays(year: i32) -> Vec<(NaiveDate, &'static str)> {
    let candidates: [(Option<NaiveDate>, &'static str); 10] = [
        // Not moved back to Friday Dec 31 when Jan 1 is a Saturday
        (new_years_observed(year), "New Year's Day"),
        (nth_weekday(year, 1, Weekday::Mon, 3), "Martin Luther King Jr. Day"),
        (nth_weekday(year, 2, Weekday::Mon, 3), "Presidents' Day"),
        (easter_sunday(year).map(|d| d - Duration::days(2)), "Good Friday"),
        (last_weekday(year, 5, Weekday::Mon), "Memorial Day"),
        (fixed_observed(year, 6, 19), "Juneteenth"),
        (fixed_observed(year, 7, 4), "Independence Day"),
        (nth_weekday(year, 9, Weekday::Mon, 1), "Labor Day"),
        (nth_weekday(year, 11, Weekday::Thu, 4), "Thanksgiving Day"),
        (fixed_observed(year, 12, 25), "Christmas Day"),
    ];

    candidates
        .into_iter()
        .filter_map(|(date, name)| date.map(|d| (d, name)))
        .collect()
}

/// Gregorian Easter Sunday (anonymous Gregorian algorithm).
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n as u8)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Saturday holidays move to Friday, Sunday holidays to Monday.
fn fixed_observed(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    match date.weekday() {
        Weekday::Sat => date.pred_opt(),
        Weekday::Sun => date.succ_opt(),
        _ => Some(date),
    }
}

fn new_years_observed(year: i32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year, 1, 1)?;
    match date.weekday() {
        Weekday::Sat => None,
        Weekday::Sun => date.succ_opt(),
        _ => Some(date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn ten_holidays_every_year() {
        assert_eq!(holidays(2024).len(), 10);
        assert_eq!(holidays(2025).len(), 10);
        // New Year's Day 2022 fell on a Saturday and is not observed
        assert_eq!(holidays(2022).len(), 9);
    }

    #[test]
    fn good_friday_follows_easter() {
        assert_eq!(easter_sunday(2024), Some(date(2024, 3, 31)));
        assert_eq!(holiday_on(date(2024, 3, 29)), Some("Good Friday"));
        assert_eq!(holiday_on(date(2025, 4, 18)), Some("Good Friday"));
        assert_eq!(holiday_on(date(2026, 4, 3)), Some("Good Friday"));
    }

    #[test]
    fn computed_monday_and_thursday_holidays() {
        assert_eq!(holiday_on(date(2024, 1, 15)), Some("Martin Luther King Jr. Day"));
        assert_eq!(holiday_on(date(2024, 2, 19)), Some("Presidents' Day"));
        assert_eq!(holiday_on(date(2024, 5, 27)), Some("Memorial Day"));
        assert_eq!(holiday_on(date(2024, 9, 2)), Some("Labor Day"));
        assert_eq!(holiday_on(date(2024, 11, 28)), Some("Thanksgiving Day"));
    }

    #[test]
    fn fixed_holidays_use_observed_day() {
        assert_eq!(holiday_on(date(2026, 7, 3)), Some("Independence Day"));
        assert_eq!(holiday_on(date(2022, 6, 20)), Some("Juneteenth"));
        assert_eq!(holiday_on(date(2022, 12, 26)), Some("Christmas Day"));
        assert_eq!(holiday_on(date(2021, 12, 31)), None);
        assert_eq!(holiday_on(date(2024, 12, 25)), Some("Christmas Day"));
    }

    #[test]
    fn weekends_are_closed() {
        let cal = MarketCalendar::new();
        assert_eq!(cal.check(utc(2024, 3, 9, 15, 0)), Err(MarketClosedReason::Weekend));
        assert_eq!(cal.check(utc(2024, 3, 10, 15, 0)), Err(MarketClosedReason::Weekend));
        assert!(cal.is_open(utc(2024, 3, 5, 15, 0)));
    }

    #[test]
    fn holidays_are_closed() {
        let cal = MarketCalendar::new();
        assert_eq!(
            cal.check(utc(2024, 7, 4, 15, 0)),
            Err(MarketClosedReason::Holiday("Independence Day"))
        );
    }

    #[test]
    fn date_is_taken_in_new_york() {
        // 02:00 UTC Saturday is still Friday evening in New York
        let cal = MarketCalendar::new();
        assert!(cal.is_open(utc(2024, 3, 9, 2, 0)));
    }

    #[test]
    fn session_hours_are_optional() {
        // 13:00 UTC = 09:00 EDT (after the March DST change)
        let early = utc(2024, 3, 12, 13, 0);
        assert!(MarketCalendar::new().is_open(early));
        assert_eq!(
            MarketCalendar::new().with_session_hours(true).check(early),
            Err(MarketClosedReason::OutsideSession)
        );
        assert!(MarketCalendar::new()
            .with_session_hours(true)
            .is_open(utc(2024, 3, 12, 14, 30)));
    }
}
