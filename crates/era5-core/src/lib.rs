//! Core domain model for the ERA5 reanalysis loader: months, status rows, aggregate targets.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "era5-core";

/// The provider has no reanalysis data before this month.
pub const PROVIDER_FLOOR: Month = Month::FLOOR;

/// Reference to a downloaded artifact, as returned by an acquisition client.
pub type ArtifactRef = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonthError {
    #[error("{year}-{month:02} is not a valid calendar month")]
    OutOfRange { year: i32, month: u32 },
    #[error("{0} is not the first day of a month")]
    NotFirstOfMonth(NaiveDate),
    #[error("cannot parse month from {0:?}, expected YYYY-MM")]
    Unparseable(String),
}

/// A calendar month, represented by its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "NaiveDate", into = "NaiveDate")]
pub struct Month(NaiveDate);

impl Month {
    const FLOOR: Month = match NaiveDate::from_ymd_opt(2000, 1, 1) {
        Some(date) => Month(date),
        None => panic!("2000-01-01 is a valid date"),
    };

    pub fn from_ymd(year: i32, month: u32) -> Result<Self, MonthError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or(MonthError::OutOfRange { year, month })
    }

    /// The month that contains `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    pub fn first_day(self) -> NaiveDate {
        self.0
    }

    pub fn last_day(self) -> NaiveDate {
        self.succ().0.pred_opt().unwrap_or(self.0)
    }

    pub fn days_in_month(self) -> u32 {
        self.last_day().day()
    }

    pub fn year(self) -> i32 {
        self.0.year()
    }

    pub fn month(self) -> u32 {
        self.0.month()
    }

    pub fn succ(self) -> Self {
        Self(self.0.checked_add_months(Months::new(1)).unwrap_or(self.0))
    }

    pub fn pred(self) -> Self {
        Self(self.0.checked_sub_months(Months::new(1)).unwrap_or(self.0))
    }

    /// Every month in `[start, end]`, ascending. Empty when `end < start`.
    pub fn range(start: Month, end: Month) -> Vec<Month> {
        let mut out = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            out.push(cursor);
            let next = cursor.succ();
            if next == cursor {
                break;
            }
            cursor = next;
        }
        out
    }
}

impl TryFrom<NaiveDate> for Month {
    type Error = MonthError;

    fn try_from(date: NaiveDate) -> Result<Self, Self::Error> {
        if date.day() != 1 {
            return Err(MonthError::NotFirstOfMonth(date));
        }
        Ok(Self(date))
    }
}

impl From<Month> for NaiveDate {
    fn from(month: Month) -> Self {
        month.0
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
    }
}

impl FromStr for Month {
    type Err = MonthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Month::try_from(date);
        }
        let unparseable = || MonthError::Unparseable(s.to_string());
        let (year, month) = trimmed.split_once('-').ok_or_else(unparseable)?;
        let year: i32 = year.parse().map_err(|_| unparseable())?;
        let month: u32 = month.parse().map_err(|_| unparseable())?;
        Month::from_ymd(year, month)
    }
}

/// Progress of one downstream consumer on a month. A null column is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStatus {
    InProgress,
    Done,
}

impl ConsumerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    /// Allowed moves: null -> in_progress -> done, and in_progress/done -> null on reset.
    pub fn can_transition(from: Option<Self>, to: Option<Self>) -> bool {
        matches!(
            (from, to),
            (None, Some(Self::InProgress))
                | (Some(Self::InProgress), Some(Self::Done))
                | (Some(Self::InProgress), None)
                | (Some(Self::Done), None)
        )
    }
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown consumer status {0:?}")]
pub struct UnknownConsumerStatus(pub String);

impl FromStr for ConsumerStatus {
    type Err = UnknownConsumerStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(UnknownConsumerStatus(other.to_string())),
        }
    }
}

/// One row of the month status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthStatus {
    pub month: Month,
    pub path: Option<String>,
    pub downloading: bool,
    pub downloading_since: Option<DateTime<Utc>>,
    /// Keyed by target name.
    pub consumers: BTreeMap<String, Option<ConsumerStatus>>,
}

impl MonthStatus {
    pub fn new(month: Month) -> Self {
        Self {
            month,
            path: None,
            downloading: false,
            downloading_since: None,
            consumers: BTreeMap::new(),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.path.is_some()
    }

    pub fn consumer(&self, target: &str) -> Option<ConsumerStatus> {
        self.consumers.get(target).copied().flatten()
    }
}

/// A downstream aggregate table whose monthly density is audited by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTarget {
    pub name: String,
    /// Optionally schema-qualified, e.g. `Municipio.copernicus_brasil`.
    pub table: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    pub status_column: String,
    pub spatial_units: u32,
    #[serde(default = "default_samples_per_day")]
    pub samples_per_day: u32,
}

fn default_timestamp_column() -> String {
    "date".to_string()
}

fn default_samples_per_day() -> u32 {
    1
}

impl AggregateTarget {
    /// Row count of a fully processed month.
    pub fn expected_rows(&self, month: Month) -> i64 {
        i64::from(self.spatial_units) * i64::from(self.samples_per_day) * i64::from(month.days_in_month())
    }

    /// Default deployment targets: every Brazilian municipality, and Foz do Iguacu alone.
    pub fn builtin() -> Vec<Self> {
        vec![
            Self {
                name: "brasil".to_string(),
                table: "Municipio.copernicus_brasil".to_string(),
                timestamp_column: default_timestamp_column(),
                status_column: "brasil".to_string(),
                spatial_units: 5570,
                samples_per_day: 1,
            },
            Self {
                name: "foz".to_string(),
                table: "Municipio.copernicus_foz".to_string(),
                timestamp_column: default_timestamp_column(),
                status_column: "foz".to_string(),
                spatial_units: 1,
                samples_per_day: 1,
            },
        ]
    }
}

/// Trigger cadence of the acquisition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    CatchUp,
    SteadyState,
}

impl Cadence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CatchUp => "catch_up",
            Self::SteadyState => "steady_state",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "catch_up" => Ok(Self::CatchUp),
            "steady_state" => Ok(Self::SteadyState),
            other => Err(format!("unknown cadence {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_bounds_follow_the_calendar() {
        let feb_leap = Month::from_ymd(2024, 2).unwrap();
        assert_eq!(feb_leap.first_day(), date(2024, 2, 1));
        assert_eq!(feb_leap.last_day(), date(2024, 2, 29));
        assert_eq!(Month::from_ymd(2023, 2).unwrap().days_in_month(), 28);
        assert_eq!(Month::from_ymd(2023, 12).unwrap().last_day(), date(2023, 12, 31));
    }

    #[test]
    fn succ_and_pred_cross_year_boundaries() {
        let dec = Month::from_ymd(2023, 12).unwrap();
        assert_eq!(dec.succ(), Month::from_ymd(2024, 1).unwrap());
        assert_eq!(dec.succ().pred(), dec);
        assert_eq!(Month::containing(date(2024, 3, 15)).pred(), Month::from_ymd(2024, 2).unwrap());
    }

    #[test]
    fn range_is_inclusive_and_empty_when_inverted() {
        let start = Month::from_ymd(2023, 11).unwrap();
        let end = Month::from_ymd(2024, 2).unwrap();
        let months = Month::range(start, end);
        assert_eq!(months.len(), 4);
        assert_eq!(months.first(), Some(&start));
        assert_eq!(months.last(), Some(&end));
        assert!(Month::range(end, start).is_empty());
        assert_eq!(Month::range(PROVIDER_FLOOR, Month::from_ymd(2024, 2).unwrap()).len(), 290);
    }

    #[test]
    fn parses_month_and_first_of_month_dates() {
        assert_eq!("2024-02".parse::<Month>().unwrap(), Month::from_ymd(2024, 2).unwrap());
        assert_eq!("2024-02-01".parse::<Month>().unwrap(), Month::from_ymd(2024, 2).unwrap());
        assert!(matches!(
            "2024-02-15".parse::<Month>(),
            Err(MonthError::NotFirstOfMonth(_))
        ));
        assert!(matches!("2024-13".parse::<Month>(), Err(MonthError::OutOfRange { .. })));
        assert!(matches!("feb".parse::<Month>(), Err(MonthError::Unparseable(_))));
        assert_eq!(Month::from_ymd(2001, 7).unwrap().to_string(), "2001-07");
    }

    #[test]
    fn month_serializes_as_first_day() {
        let month = Month::from_ymd(2024, 2).unwrap();
        let json = serde_json::to_string(&month).unwrap();
        assert_eq!(json, "\"2024-02-01\"");
        assert!(serde_json::from_str::<Month>("\"2024-02-10\"").is_err());
    }

    #[test]
    fn consumer_status_never_skips_in_progress() {
        use ConsumerStatus::*;
        assert!(ConsumerStatus::can_transition(None, Some(InProgress)));
        assert!(ConsumerStatus::can_transition(Some(InProgress), Some(Done)));
        assert!(ConsumerStatus::can_transition(Some(Done), None));
        assert!(ConsumerStatus::can_transition(Some(InProgress), None));
        assert!(!ConsumerStatus::can_transition(None, Some(Done)));
        assert!(!ConsumerStatus::can_transition(Some(Done), Some(InProgress)));
        assert_eq!("in_progress".parse::<ConsumerStatus>().unwrap(), InProgress);
        assert!("finished".parse::<ConsumerStatus>().is_err());
    }

    #[test]
    fn expected_rows_scales_with_days_in_month() {
        let target = AggregateTarget {
            name: "sample".into(),
            table: "sample".into(),
            timestamp_column: "date".into(),
            status_column: "sample".into(),
            spatial_units: 10,
            samples_per_day: 1,
        };
        assert_eq!(target.expected_rows(Month::from_ymd(2023, 11).unwrap()), 300);
        assert_eq!(target.expected_rows(Month::from_ymd(2024, 2).unwrap()), 290);
        let brasil = &AggregateTarget::builtin()[0];
        assert_eq!(brasil.expected_rows(Month::from_ymd(2023, 1).unwrap()), 5570 * 31);
    }
}
