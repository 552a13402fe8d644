//! Core domain model for the regional COVID-19 data cache.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "covreg-core";

/// One province row after normalization, immediately before aggregation.
///
/// Ephemeral: produced from a single raw upstream record and consumed by the
/// aggregation fold in the same run. Invariants: `region_code` and
/// `region_name` are non-empty and trimmed, `case_count >= 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProvinceRecord {
    pub submission_date: NaiveDate,
    pub region_code: String,
    pub region_name: String,
    pub case_count: i64,
}

/// The persisted aggregate: one row per `(submission_date, region_name)`.
///
/// `total_positive_cases` is the sum of `case_count` over every province
/// record sharing the region code for that date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDayRecord {
    pub submission_date: NaiveDate,
    pub region_code: String,
    pub region_name: String,
    pub total_positive_cases: i64,
}

/// Sortable columns of a [`RegionDayRecord`].
///
/// The set is closed on purpose: callers hand in an arbitrary tag and an
/// unrecognized one falls back to the default order instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    TotalPositiveCases,
    RegionName,
    RegionCode,
    SubmissionDate,
}

impl SortField {
    /// Resolve a caller-supplied field tag. `None` means "use default order".
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "total_positive_cases" => Some(Self::TotalPositiveCases),
            "region_name" => Some(Self::RegionName),
            "region_code" => Some(Self::RegionCode),
            "submission_date" => Some(Self::SubmissionDate),
            _ => None,
        }
    }

    /// Column name as stored, for building `ORDER BY` clauses.
    pub fn column(&self) -> &'static str {
        match self {
            Self::TotalPositiveCases => "total_positive_cases",
            Self::RegionName => "region_name",
            Self::RegionCode => "region_code",
            Self::SubmissionDate => "submission_date",
        }
    }

    fn compare(&self, a: &RegionDayRecord, b: &RegionDayRecord) -> Ordering {
        match self {
            Self::TotalPositiveCases => a.total_positive_cases.cmp(&b.total_positive_cases),
            Self::RegionName => a.region_name.cmp(&b.region_name),
            Self::RegionCode => a.region_code.cmp(&b.region_code),
            Self::SubmissionDate => a.submission_date.cmp(&b.submission_date),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        Self::Desc
    }
}

impl SortDirection {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Default order: `total_positive_cases DESC, region_name ASC`.
pub fn default_order(a: &RegionDayRecord, b: &RegionDayRecord) -> Ordering {
    b.total_positive_cases
        .cmp(&a.total_positive_cases)
        .then_with(|| a.region_name.cmp(&b.region_name))
}

/// Sort rows in place by an optional field + direction.
///
/// `field: None` (or an unrecognized tag resolved upstream to `None`)
/// applies the default order; the direction is ignored in that case.
pub fn sort_rows(rows: &mut [RegionDayRecord], field: Option<SortField>, direction: SortDirection) {
    match field {
        Some(field) => rows.sort_by(|a, b| {
            let ord = field.compare(a, b);
            match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        }),
        None => rows.sort_by(default_order),
    }
}
