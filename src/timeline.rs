//! Temporal composition schemas and period decoding.
//!
//! Two schemas exist: `M` (calendar months, one period per month) and a
//! cyclic `<N>D` step (N-day windows anchored at the start of each year,
//! with the final window of a year clipped to December 31). The sentinel
//! schema `Anull` belongs to IDENTITY cubes and yields no periods.

use chrono::{Datelike, Days, NaiveDate};

use crate::error::{CubeError, Result};

/// A time window at day granularity. Both bounds are inclusive dates; the
/// window covers `[start 00:00, end 24:00)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn label(&self) -> String {
        format!("{}_{}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Days in the window.
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalSchema {
    Monthly,
    /// Cyclic windows of `step` days anchored at January 1st.
    Cyclic { step_days: u32 },
    /// No temporal aggregation (IDENTITY cubes).
    Identity,
}

impl TemporalSchema {
    /// Parse a temporal composition label (`1M`, `16D`, `Anull`).
    pub fn parse(label: &str) -> Result<Self> {
        if label == "Anull" {
            return Ok(TemporalSchema::Identity);
        }
        let (num, unit) = label.split_at(label.len().saturating_sub(1));
        let step: u32 = num
            .parse()
            .map_err(|_| CubeError::Validation(format!("bad temporal schema '{label}'")))?;
        match unit {
            "M" if step == 1 => Ok(TemporalSchema::Monthly),
            "D" if step > 0 => Ok(TemporalSchema::Cyclic { step_days: step }),
            _ => Err(CubeError::Validation(format!("bad temporal schema '{label}'"))),
        }
    }

    pub fn label(&self) -> String {
        match self {
            TemporalSchema::Monthly => "1M".to_string(),
            TemporalSchema::Cyclic { step_days } => format!("{step_days}D"),
            TemporalSchema::Identity => "Anull".to_string(),
        }
    }
}

fn month_bounds(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    (start, next - Days::new(1))
}

/// Expand a temporal schema over `[start, end]` into the periods that
/// intersect the range. `Identity` yields no periods.
pub fn decode_periods(schema: TemporalSchema, start: NaiveDate, end: NaiveDate) -> Result<Vec<Period>> {
    if start > end {
        return Err(CubeError::Validation(format!(
            "invalid date range: {start} > {end}"
        )));
    }

    let mut periods = Vec::new();
    match schema {
        TemporalSchema::Identity => {}
        TemporalSchema::Monthly => {
            let (mut year, mut month) = (start.year(), start.month());
            loop {
                let (p_start, p_end) = month_bounds(year, month);
                if p_start > end {
                    break;
                }
                periods.push(Period { start: p_start, end: p_end });
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
        }
        TemporalSchema::Cyclic { step_days } => {
            for year in start.year()..=end.year() {
                let year_start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
                let year_end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap();
                let mut p_start = year_start;
                while p_start <= year_end {
                    let p_end = (p_start + Days::new(u64::from(step_days) - 1)).min(year_end);
                    if p_start <= end && p_end >= start {
                        periods.push(Period { start: p_start, end: p_end });
                    }
                    p_start = p_end + Days::new(1);
                }
            }
        }
    }
    Ok(periods)
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| CubeError::Validation(format!("bad date '{s}', expected YYYY-MM-DD")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn monthly_covers_range_without_overlap() {
        let periods =
            decode_periods(TemporalSchema::Monthly, d("2019-01-15"), d("2019-04-02")).unwrap();
        assert_eq!(periods.len(), 4);
        assert_eq!(periods[0].label(), "2019-01-01_2019-01-31");
        assert_eq!(periods[3].label(), "2019-04-01_2019-04-30");
        for pair in periods.windows(2) {
            assert_eq!(pair[0].end + Days::new(1), pair[1].start);
        }
    }

    #[test]
    fn monthly_handles_year_boundary() {
        let periods =
            decode_periods(TemporalSchema::Monthly, d("2018-12-01"), d("2019-01-31")).unwrap();
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].label(), "2018-12-01_2018-12-31");
        assert_eq!(periods[1].label(), "2019-01-01_2019-01-31");
    }

    #[test]
    fn cyclic_anchors_at_year_start_and_clips() {
        let periods = decode_periods(
            TemporalSchema::Cyclic { step_days: 16 },
            d("2019-01-01"),
            d("2019-12-31"),
        )
        .unwrap();
        assert_eq!(periods[0].label(), "2019-01-01_2019-01-16");
        assert_eq!(periods[1].label(), "2019-01-17_2019-02-01");
        // 365 = 22 * 16 + 13: the last window is clipped.
        assert_eq!(periods.len(), 23);
        let last = periods.last().unwrap();
        assert_eq!(last.end, d("2019-12-31"));
        assert_eq!(last.len_days(), 13);
    }

    #[test]
    fn cyclic_reanchors_each_year() {
        let periods = decode_periods(
            TemporalSchema::Cyclic { step_days: 16 },
            d("2018-12-20"),
            d("2019-01-10"),
        )
        .unwrap();
        // Clipped tail of 2018 plus the first full window of 2019.
        assert_eq!(periods.first().unwrap().end, d("2018-12-31"));
        assert!(periods.iter().any(|p| p.label() == "2019-01-01_2019-01-16"));
    }

    #[test]
    fn identity_yields_no_periods() {
        let periods =
            decode_periods(TemporalSchema::Identity, d("2019-01-01"), d("2019-12-31")).unwrap();
        assert!(periods.is_empty());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(decode_periods(TemporalSchema::Monthly, d("2019-02-01"), d("2019-01-01")).is_err());
    }

    #[test]
    fn schema_labels_round_trip() {
        for label in ["1M", "16D", "Anull"] {
            assert_eq!(TemporalSchema::parse(label).unwrap().label(), label);
        }
        assert!(TemporalSchema::parse("2M").is_err());
        assert!(TemporalSchema::parse("0D").is_err());
    }
}
