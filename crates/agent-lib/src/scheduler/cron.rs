//! Five-field cron expressions
//!
//! Fields are minute, hour, day-of-month, month and day-of-week (0 = Sunday).
//! Each field is a comma list of `*`, `*/step`, `a-b`, `a-b/step` or a single
//! integer. All five fields must match; day-of-month and day-of-week are
//! ANDed like every other field.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;

/// How far `next_after` searches before giving up
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// One of the five cron fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    pub const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day-of-month",
            CronField::Month => "month",
            CronField::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive bounds of the field
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            CronField::DayOfWeek => (0, 6),
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an expression was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    #[error("{field} field: invalid value {token:?}")]
    InvalidValue { field: CronField, token: String },

    #[error("{field} field: value {value} out of range {min}-{max}")]
    OutOfRange {
        field: CronField,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field} field: invalid step in {token:?}")]
    InvalidStep { field: CronField, token: String },

    #[error("{field} field: range {start}-{end} is empty")]
    EmptyRange {
        field: CronField,
        start: u32,
        end: u32,
    },
}

impl CronError {
    /// The offending field, when the error is about a single field
    pub fn field(&self) -> Option<CronField> {
        match self {
            CronError::FieldCount(_) => None,
            CronError::InvalidValue { field, .. }
            | CronError::OutOfRange { field, .. }
            | CronError::InvalidStep { field, .. }
            | CronError::EmptyRange { field, .. } => Some(*field),
        }
    }
}

/// Set of allowed values for one field, as a bitmask (all bounds fit in 64)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FieldSet(u64);

impl FieldSet {
    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn values(&self) -> Vec<u32> {
        (0..64).filter(|v| self.contains(*v)).collect()
    }
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSet {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronSet {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            minutes: parse_field(fields[0], CronField::Minute)?,
            hours: parse_field(fields[1], CronField::Hour)?,
            days_of_month: parse_field(fields[2], CronField::DayOfMonth)?,
            months: parse_field(fields[3], CronField::Month)?,
            days_of_week: parse_field(fields[4], CronField::DayOfWeek)?,
        })
    }

    fn set(&self, field: CronField) -> &FieldSet {
        match field {
            CronField::Minute => &self.minutes,
            CronField::Hour => &self.hours,
            CronField::DayOfMonth => &self.days_of_month,
            CronField::Month => &self.months,
            CronField::DayOfWeek => &self.days_of_week,
        }
    }

    /// Allowed values of one field, ascending
    pub fn values(&self, field: CronField) -> Vec<u32> {
        self.set(field).values()
    }

    /// Whether `t` falls on a minute the expression selects
    pub fn matches<T: Datelike + Timelike>(&self, t: &T) -> bool {
        self.minutes.contains(t.minute())
            && self.hours.contains(t.hour())
            && self.date_matches(t)
    }

    fn date_matches<T: Datelike>(&self, t: &T) -> bool {
        self.days_of_month.contains(t.day())
            && self.months.contains(t.month())
            && self.days_of_week.contains(t.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `t`, or `None` if nothing
    /// matches within four years.
    pub fn next_after(&self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut candidate = t.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = candidate + Duration::days(SEARCH_HORIZON_DAYS);

        while candidate <= horizon {
            let date = candidate.date();

            if !self.months.contains(date.month()) {
                candidate = first_of_next_month(date)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.date_matches(&date) {
                candidate = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = date.and_hms_opt(candidate.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }
}

impl FromStr for CronSet {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSet::parse(s)
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_field(text: &str, field: CronField) -> Result<FieldSet, CronError> {
    let mut set = FieldSet::default();
    for part in text.split(',') {
        parse_part(part, field, &mut set)?;
    }
    Ok(set)
}

fn parse_part(part: &str, field: CronField, set: &mut FieldSet) -> Result<(), CronError> {
    let (min, max) = field.bounds();

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(parse_step(step, part, field)?)),
        None => (part, None),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((lo, hi)) = range.split_once('-') {
        let lo = parse_value(lo, part, field)?;
        let hi = parse_value(hi, part, field)?;
        if lo > hi {
            return Err(CronError::EmptyRange {
                field,
                start: lo,
                end: hi,
            });
        }
        (lo, hi)
    } else {
        // a step needs a range to walk
        if step.is_some() {
            return Err(CronError::InvalidValue {
                field,
                token: part.to_string(),
            });
        }
        let value = parse_value(range, part, field)?;
        (value, value)
    };

    for value in [start, end] {
        if value < min || value > max {
            return Err(CronError::OutOfRange {
                field,
                value,
                min,
                max,
            });
        }
    }

    let step = step.unwrap_or(1);
    let mut value = start;
    while value <= end {
        set.insert(value);
        value = match value.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

fn parse_value(text: &str, part: &str, field: CronField) -> Result<u32, CronError> {
    text.parse().map_err(|_| CronError::InvalidValue {
        field,
        token: part.to_string(),
    })
}

fn parse_step(text: &str, part: &str, field: CronField) -> Result<u32, CronError> {
    match text.parse::<i64>() {
        Ok(step) if step > 0 => Ok(step.min(u32::MAX as i64) as u32),
        _ => Err(CronError::InvalidStep {
            field,
            token: part.to_string(),
        }),
    }
}
