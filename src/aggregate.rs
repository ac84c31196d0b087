//! Reduction of a loan's monthly observations of a static field to one value
//!
//! Every policy skips the field's missing sentinel (and any extra codes the
//! field declares as missing). A field with no valid observation reduces to
//! its sentinel.

use std::cmp::Ordering;
use std::fmt;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::model::{FieldKind, Value};

/// How a static field is reduced across months
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Arithmetic mean of valid values; integer fields truncate toward zero
    Mean,
    /// Largest valid value; for dates the latest
    Max,
    /// Earliest valid value in period order
    First,
    /// Most recent valid value in period order
    Last,
    /// Earliest date whose year is above a plausibility floor
    FirstAfter {
        /// Dates in or before this year are rejected
        min_year: i32,
    },
    /// Most frequent valid value, ties going to the first encountered
    Mode,
    /// `flag` if it was reported in any month, otherwise `otherwise`
    AnyTrue {
        /// Positive code
        flag: String,
        /// Negative code
        #[serde(default = "default_negative")]
        otherwise: String,
    },
    /// Value of the first month, whether missing or not
    Leading,
}

fn default_negative() -> String {
    "N".to_string()
}

impl AggregationPolicy {
    /// Whether this policy can reduce values of `kind`
    #[must_use]
    pub const fn supports(&self, kind: FieldKind) -> bool {
        match self {
            Self::Mean => matches!(kind, FieldKind::Float | FieldKind::Int),
            Self::Max => matches!(kind, FieldKind::Float | FieldKind::Int | FieldKind::Date),
            Self::FirstAfter { .. } => matches!(kind, FieldKind::Date),
            Self::AnyTrue { .. } => matches!(kind, FieldKind::Str),
            Self::First | Self::Last | Self::Mode | Self::Leading => true,
        }
    }

    /// Shorthand for `AnyTrue` with the `Y`/`N` codes
    #[must_use]
    pub fn any_yes() -> Self {
        Self::AnyTrue {
            flag: "Y".to_string(),
            otherwise: default_negative(),
        }
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Max => write!(f, "max"),
            Self::First => write!(f, "first"),
            Self::Last => write!(f, "last"),
            Self::FirstAfter { min_year } => write!(f, "first after {min_year}"),
            Self::Mode => write!(f, "mode"),
            Self::AnyTrue { flag, .. } => write!(f, "any {flag}"),
            Self::Leading => write!(f, "leading"),
        }
    }
}

/// The values that mean "not reported" for one field
#[derive(Debug, Clone, Copy)]
pub struct Sentinel<'a> {
    missing: &'a Value,
    also: &'a [Value],
}

impl<'a> Sentinel<'a> {
    /// Sentinel with only the declared missing value
    #[must_use]
    pub const fn new(missing: &'a Value) -> Self {
        Self { missing, also: &[] }
    }

    /// Add further codes that are treated as missing
    #[must_use]
    pub const fn with_also(mut self, also: &'a [Value]) -> Self {
        self.also = also;
        self
    }

    /// The declared missing value
    #[must_use]
    pub const fn missing(&self) -> &'a Value {
        self.missing
    }

    /// Whether `value` carries data
    #[must_use]
    pub fn is_valid(&self, value: &Value) -> bool {
        if value == self.missing || self.also.contains(value) {
            return false;
        }
        !matches!(value, Value::Float(x) if x.is_nan())
    }
}

/// Result of reducing one field for one loan
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
    /// Representative value, or the sentinel
    pub value: Value,
    /// Number of valid observations seen
    pub valid: usize,
}

impl Aggregated {
    fn missing(sentinel: &Sentinel<'_>, valid: usize) -> Self {
        Self {
            value: sentinel.missing().clone(),
            valid,
        }
    }

    /// Whether any valid data was found
    #[must_use]
    pub const fn found(&self) -> bool {
        self.valid > 0
    }
}

/// Reduce the ordered observations of one field with `policy`
///
/// `values` must be in period order. Values of a kind other than the
/// sentinel's are ignored by the numeric policies.
pub fn aggregate<'v, I>(policy: &AggregationPolicy, sentinel: &Sentinel<'_>, values: I) -> Aggregated
where
    I: IntoIterator<Item = &'v Value>,
    I::IntoIter: DoubleEndedIterator,
{
    let values = values.into_iter();
    match policy {
        AggregationPolicy::Mean => mean(sentinel, values),
        AggregationPolicy::Max => max(sentinel, values),
        AggregationPolicy::First => pick(sentinel, values, |_| true),
        AggregationPolicy::Last => pick(sentinel, values.rev(), |_| true),
        AggregationPolicy::FirstAfter { min_year } => pick(sentinel, values, |v| {
            v.as_date().is_some_and(|d| d.year() > *min_year)
        }),
        AggregationPolicy::Mode => mode(sentinel, values),
        AggregationPolicy::AnyTrue { flag, otherwise } => any_true(sentinel, values, flag, otherwise),
        AggregationPolicy::Leading => leading(sentinel, values),
    }
}

fn mean<'v>(sentinel: &Sentinel<'_>, values: impl Iterator<Item = &'v Value>) -> Aggregated {
    let (sum, count) = values
        .filter(|v| sentinel.is_valid(v))
        .filter_map(Value::as_f64)
        .fold((0.0_f64, 0_usize), |(sum, count), x| (sum + x, count + 1));

    if count == 0 {
        return Aggregated::missing(sentinel, 0);
    }

    let avg = sum / count as f64;
    let value = match sentinel.missing().kind() {
        FieldKind::Int => Value::Int(avg.trunc() as i32),
        _ => Value::Float(avg as f32),
    };
    Aggregated { value, valid: count }
}

fn max<'v>(sentinel: &Sentinel<'_>, values: impl Iterator<Item = &'v Value>) -> Aggregated {
    let kind = sentinel.missing().kind();
    let mut best: Option<&Value> = None;
    let mut valid = 0;
    for value in values.filter(|v| sentinel.is_valid(v) && v.kind() == kind) {
        valid += 1;
        best = match best {
            Some(current) if current.partial_cmp(value) != Some(Ordering::Less) => Some(current),
            _ => Some(value),
        };
    }
    match best {
        Some(value) => Aggregated {
            value: value.clone(),
            valid,
        },
        None => Aggregated::missing(sentinel, 0),
    }
}

fn pick<'v>(
    sentinel: &Sentinel<'_>,
    values: impl Iterator<Item = &'v Value>,
    accept: impl Fn(&Value) -> bool,
) -> Aggregated {
    let mut valid = 0;
    let mut chosen = None;
    for value in values.filter(|v| sentinel.is_valid(v)) {
        valid += 1;
        if chosen.is_none() && accept(value) {
            chosen = Some(value);
        }
    }
    match chosen {
        Some(value) => Aggregated {
            value: value.clone(),
            valid,
        },
        None => Aggregated::missing(sentinel, 0),
    }
}

fn mode<'v>(sentinel: &Sentinel<'_>, values: impl Iterator<Item = &'v Value>) -> Aggregated {
    // first-seen order is kept so ties resolve to the earliest value
    let mut tally: SmallVec<[(&Value, usize); 8]> = SmallVec::new();
    let mut valid = 0;
    for value in values.filter(|v| sentinel.is_valid(v)) {
        valid += 1;
        match tally.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }

    let mut winner: Option<(&Value, usize)> = None;
    for &(value, count) in &tally {
        if winner.is_none_or(|(_, best)| count > best) {
            winner = Some((value, count));
        }
    }
    match winner {
        Some((value, _)) => Aggregated {
            value: value.clone(),
            valid,
        },
        None => Aggregated::missing(sentinel, 0),
    }
}

fn any_true<'v>(
    sentinel: &Sentinel<'_>,
    values: impl Iterator<Item = &'v Value>,
    flag: &str,
    otherwise: &str,
) -> Aggregated {
    let mut valid = 0;
    let mut hit = false;
    for value in values.filter(|v| sentinel.is_valid(v)) {
        valid += 1;
        hit |= value.as_str() == Some(flag);
    }
    if valid == 0 {
        return Aggregated::missing(sentinel, 0);
    }
    let code = if hit { flag } else { otherwise };
    Aggregated {
        value: Value::from(code),
        valid,
    }
}

fn leading<'v>(sentinel: &Sentinel<'_>, mut values: impl Iterator<Item = &'v Value>) -> Aggregated {
    let Some(first) = values.next() else {
        return Aggregated::missing(sentinel, 0);
    };
    let valid = usize::from(sentinel.is_valid(first)) + values.filter(|v| sentinel.is_valid(v)).count();
    Aggregated {
        value: first.clone(),
        valid,
    }
}
