//! Core row and record types
//!
//! A [`RawObservation`] is one loan in one month. A [`ConsolidatedRecord`] is
//! one loan across all of its months.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::linkage::Linkage;
use crate::qa::QaSummary;

/// Declared storage type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// 32-bit float
    Float,
    /// 32-bit signed integer
    Int,
    /// Text or categorical code
    Str,
    /// Calendar date
    Date,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "Float32"),
            Self::Int => write!(f, "Int32"),
            Self::Str => write!(f, "String"),
            Self::Date => write!(f, "Date"),
        }
    }
}

/// A single typed attribute value
///
/// Deserializes untagged so field declarations can write sentinels as plain
/// JSON literals; [`Value::coerce`] fixes the variant against the declared kind.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer value
    Int(i32),
    /// Float value
    Float(f32),
    /// Date value
    Date(NaiveDate),
    /// Text value
    Str(String),
}

impl Value {
    /// Kind of this value
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        match self {
            Self::Int(_) => FieldKind::Int,
            Self::Float(_) => FieldKind::Float,
            Self::Date(_) => FieldKind::Date,
            Self::Str(_) => FieldKind::Str,
        }
    }

    /// Convert a literal into the declared kind, if it can represent it
    #[must_use]
    pub fn coerce(self, kind: FieldKind) -> Option<Self> {
        match (self, kind) {
            (v @ Self::Int(_), FieldKind::Int)
            | (v @ Self::Float(_), FieldKind::Float)
            | (v @ Self::Date(_), FieldKind::Date)
            | (v @ Self::Str(_), FieldKind::Str) => Some(v),
            (Self::Int(i), FieldKind::Float) => Some(Self::Float(i as f32)),
            (Self::Float(x), FieldKind::Int) if x.fract() == 0.0 => Some(Self::Int(x as i32)),
            (Self::Str(s), FieldKind::Date) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .ok()
                .map(Self::Date),
            (Self::Date(d), FieldKind::Str) => Some(Self::Str(d.format("%Y-%m-%d").to_string())),
            _ => None,
        }
    }

    /// Numeric view used by mean and max
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(f64::from(*i)),
            Self::Float(x) => Some(f64::from(*x)),
            _ => None,
        }
    }

    /// String view
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Date view
    #[must_use]
    pub const fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y/%-m/%-d")),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

/// Outcome of upstream validation for one field in one month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Validity {
    /// Value passed its declared constraints
    #[default]
    Pass,
    /// Value violated its declared type or constraints
    Fail,
    /// Value was absent and replaced by the declared default
    Default,
}

impl Validity {
    /// `Default` counts as a pass
    #[must_use]
    pub const fn failed(self) -> bool {
        matches!(self, Self::Fail)
    }
}

/// One row per (loan, month)
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    /// Loan identifier
    pub entity_id: String,
    /// Month of the observation
    pub period: NaiveDate,
    /// Attribute values, parallel to the declared source fields
    pub values: Vec<Value>,
    /// Validation flags, parallel to `values`
    pub validity: Vec<Validity>,
}

impl RawObservation {
    /// Create an observation where every field passed validation
    pub fn new(entity_id: impl Into<String>, period: NaiveDate, values: Vec<Value>) -> Self {
        let validity = vec![Validity::Pass; values.len()];
        Self {
            entity_id: entity_id.into(),
            period,
            values,
            validity,
        }
    }

    /// Replace the validation flags
    #[must_use]
    pub fn with_validity(mut self, validity: Vec<Validity>) -> Self {
        self.validity = validity;
        self
    }
}

/// One row per loan
///
/// `monthly` and `statics` are parallel to the output columns of the
/// [`CollapsePlan`](crate::schema::CollapsePlan) that produced the record;
/// use the plan's lookup helpers to access a column by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedRecord {
    /// Loan identifier, unique within one output extent
    pub entity_id: String,
    /// Observed months, ascending, normalised to month end
    pub periods: Vec<NaiveDate>,
    /// One sequence per monthly column, each of length `periods.len()`
    pub monthly: Vec<Vec<Value>>,
    /// One value per static or derived scalar column
    pub statics: Vec<Value>,
    /// Per-field validation summary
    pub qa: QaSummary,
    /// Refinance links
    pub linkage: Linkage,
}

impl ConsolidatedRecord {
    /// Number of months observed for this loan
    #[must_use]
    pub fn months(&self) -> usize {
        self.periods.len()
    }
}

/// Last calendar day of the month containing `date`
#[must_use]
pub fn period_end(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}

/// Whole months from `from` to `to`, negative when `to` precedes `from`
#[must_use]
pub fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}
