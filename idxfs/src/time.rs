use std::convert::TryFrom;
use time::{OffsetDateTime, UtcOffset};

/// A DOS style packed date and time, precise to two seconds.
///
/// `year - 1980 : 7 | month : 4 | day : 5 | hour : 5 | minute : 6 | second / 2 : 5`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PackedTime(u32);

impl PackedTime {
    pub fn from_raw(raw: u32) -> Self {
        PackedTime(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Packs a calendar date. Years before 1980 clamp to 1980 and years past 2107
    /// clamp to 2107, the range seven bits can hold.
    pub fn new(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Self {
        let year = year.max(1980).min(2107) - 1980;
        PackedTime(
            year << 25
                | (month & 0xF) << 21
                | (day & 0x1F) << 16
                | (hour & 0x1F) << 11
                | (minute & 0x3F) << 5
                | (second / 2) & 0x1F,
        )
    }

    /// Converts seconds since the unix epoch (UTC). Instants past what the
    /// calendar can represent clamp to the last packable time.
    pub fn from_unix(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        match OffsetDateTime::from_unix_timestamp(secs) {
            Ok(at) => at.into(),
            Err(_) => PackedTime::new(2107, 12, 31, 23, 59, 58),
        }
    }

    pub fn year(self) -> u32 {
        (self.0 >> 25) + 1980
    }

    pub fn month(self) -> u32 {
        (self.0 >> 21) & 0xF
    }

    pub fn day(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }

    pub fn hour(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }

    pub fn minute(self) -> u32 {
        (self.0 >> 5) & 0x3F
    }

    pub fn second(self) -> u32 {
        (self.0 & 0x1F) * 2
    }
}

impl From<OffsetDateTime> for PackedTime {
    fn from(at: OffsetDateTime) -> Self {
        let at = at.to_offset(UtcOffset::UTC);
        PackedTime::new(
            at.year().max(0) as u32,
            u8::from(at.month()) as u32,
            at.day() as u32,
            at.hour() as u32,
            at.minute() as u32,
            at.second() as u32,
        )
    }
}

/// Source of timestamps for node records.
pub trait Clock {
    fn now(&self) -> PackedTime;
}

/// Wall clock time in UTC.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PackedTime {
        OffsetDateTime::now_utc().into()
    }
}

/// Always reports the same instant. Handy for reproducible images.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub PackedTime);

impl Clock for FixedClock {
    fn now(&self) -> PackedTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_calendar_fields() {
        let t = PackedTime::new(2021, 3, 14, 15, 9, 27);
        assert_eq!(t.year(), 2021);
        assert_eq!(t.month(), 3);
        assert_eq!(t.day(), 14);
        assert_eq!(t.hour(), 15);
        assert_eq!(t.minute(), 9);
        // Two second resolution.
        assert_eq!(t.second(), 26);
    }

    #[test]
    fn converts_unix_seconds() {
        // 2000-02-29T23:59:58Z
        let t = PackedTime::from_unix(951_868_798);
        assert_eq!((t.year(), t.month(), t.day()), (2000, 2, 29));
        assert_eq!((t.hour(), t.minute(), t.second()), (23, 59, 58));
    }

    #[test]
    fn epoch_clamps_to_dos_range() {
        let t = PackedTime::from_unix(0);
        assert_eq!(t.year(), 1980);
    }

    #[test]
    fn converts_offset_date_times_to_utc() {
        // 2021-03-14T23:30:00+02:00 is 21:30 UTC on the same day.
        let local = OffsetDateTime::from_unix_timestamp(1_615_757_400)
            .unwrap()
            .to_offset(UtcOffset::from_hms(2, 0, 0).unwrap());
        let t = PackedTime::from(local);
        assert_eq!((t.year(), t.month(), t.day()), (2021, 3, 14));
        assert_eq!((t.hour(), t.minute()), (21, 30));
    }

    #[test]
    fn far_future_clamps_to_last_packable_year() {
        assert_eq!(PackedTime::from_unix(u64::MAX).year(), 2107);
    }

    #[test]
    fn later_times_order_after_earlier_ones() {
        assert!(PackedTime::new(2020, 1, 1, 0, 0, 0) < PackedTime::new(2020, 1, 1, 0, 0, 2));
    }
}
