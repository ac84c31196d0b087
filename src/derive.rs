//! Columns computed from a loan's consolidated values
//!
//! Derived columns read aggregated static fields, never raw months, so they
//! are evaluated after every static field has been reduced.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::model::{FieldKind, Value, months_between};

fn default_floor_year() -> i32 {
    1990
}

fn default_age_missing() -> i32 {
    -1000
}

fn default_vintage_missing() -> String {
    "!".to_string()
}

fn default_value_missing() -> f32 {
    -1.0
}

fn default_buckets() -> u32 {
    20
}

/// A derived output column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSpec {
    /// Output column name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// How the column is computed
    #[serde(flatten)]
    pub rule: DerivedRule,
}

impl DerivedSpec {
    /// Create a derived column
    pub fn new(name: impl Into<String>, rule: DerivedRule) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            rule,
        }
    }

    /// Attach a description
    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Computation behind a derived column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "derive", rename_all = "snake_case")]
pub enum DerivedRule {
    /// Months from a date to each observed period
    AgeAtPeriod {
        /// Static date field to count from
        from: String,
        /// Dates in or before this year give `missing`
        #[serde(default = "default_floor_year")]
        floor_year: i32,
        /// Value when the date is implausible
        #[serde(default = "default_age_missing")]
        missing: i32,
    },
    /// Calendar quarter of a date, as `2004Q3`
    Vintage {
        /// Static date field
        from: String,
        /// Value when the date is missing
        #[serde(default = "default_vintage_missing")]
        missing: String,
    },
    /// Collateral value implied by a balance and a loan-to-value percentage
    OriginationValue {
        /// Static balance field
        balance: String,
        /// Static ratio field, in percent
        ratio: String,
        /// Value when either input is missing
        #[serde(default = "default_value_missing")]
        missing: f32,
    },
    /// `Y` if a string field contains `needle`, ignoring case, else `N`
    ContainsFlag {
        /// Static string field
        from: String,
        /// Text to look for
        needle: String,
    },
    /// Stable hash bucket of the loan id
    Bucket {
        /// Number of buckets
        #[serde(default = "default_buckets")]
        buckets: u32,
    },
}

/// A derived value for one loan
#[derive(Debug, Clone, PartialEq)]
pub enum Derived {
    /// One value
    Scalar(Value),
    /// One value per period
    Monthly(Vec<Value>),
}

impl DerivedRule {
    /// Kind of the produced values
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        match self {
            Self::AgeAtPeriod { .. } | Self::Bucket { .. } => FieldKind::Int,
            Self::Vintage { .. } | Self::ContainsFlag { .. } => FieldKind::Str,
            Self::OriginationValue { .. } => FieldKind::Float,
        }
    }

    /// True when the column is a per-period sequence
    #[must_use]
    pub const fn is_monthly(&self) -> bool {
        matches!(self, Self::AgeAtPeriod { .. })
    }

    /// Value written when inputs are missing
    #[must_use]
    pub fn missing(&self) -> Value {
        match self {
            Self::AgeAtPeriod { missing, .. } => Value::Int(*missing),
            Self::Vintage { missing, .. } => Value::Str(missing.clone()),
            Self::OriginationValue { missing, .. } => Value::Float(*missing),
            Self::ContainsFlag { .. } => Value::from("N"),
            Self::Bucket { .. } => Value::Int(0),
        }
    }

    /// Static fields read by the rule, with the kinds each accepts
    #[must_use]
    pub fn inputs(&self) -> Vec<(&str, &'static [FieldKind])> {
        const DATE: &[FieldKind] = &[FieldKind::Date];
        const NUMBER: &[FieldKind] = &[FieldKind::Float, FieldKind::Int];
        const TEXT: &[FieldKind] = &[FieldKind::Str];
        match self {
            Self::AgeAtPeriod { from, .. } | Self::Vintage { from, .. } => vec![(from.as_str(), DATE)],
            Self::OriginationValue { balance, ratio, .. } => {
                vec![(balance.as_str(), NUMBER), (ratio.as_str(), NUMBER)]
            }
            Self::ContainsFlag { from, .. } => vec![(from.as_str(), TEXT)],
            Self::Bucket { .. } => Vec::new(),
        }
    }

    /// Evaluate for one loan
    ///
    /// `inputs` is parallel to [`DerivedRule::inputs`]; `None` marks an input
    /// that aggregated to its missing sentinel.
    #[must_use]
    pub fn compute(&self, entity_id: &str, periods: &[NaiveDate], inputs: &[Option<&Value>]) -> Derived {
        let first = inputs.first().copied().flatten();
        match self {
            Self::AgeAtPeriod {
                floor_year, missing, ..
            } => {
                let start = first.and_then(Value::as_date).filter(|d| d.year() > *floor_year);
                let ages = periods
                    .iter()
                    .map(|period| Value::Int(start.map_or(*missing, |s| months_between(s, *period))))
                    .collect();
                Derived::Monthly(ages)
            }
            Self::Vintage { .. } => Derived::Scalar(
                first
                    .and_then(Value::as_date)
                    .map_or_else(|| self.missing(), |d| Value::Str(vintage(d))),
            ),
            Self::OriginationValue { .. } => {
                let balance = first.and_then(Value::as_f64);
                let ratio = inputs.get(1).copied().flatten().and_then(Value::as_f64);
                let value = match (balance, ratio) {
                    (Some(balance), Some(ratio)) if ratio > 0.0 => Value::Float((balance / (ratio / 100.0)) as f32),
                    _ => self.missing(),
                };
                Derived::Scalar(value)
            }
            Self::ContainsFlag { needle, .. } => {
                let hit = first
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase()));
                Derived::Scalar(Value::from(if hit { "Y" } else { "N" }))
            }
            Self::Bucket { buckets } => Derived::Scalar(Value::Int(bucket(entity_id, *buckets))),
        }
    }
}

/// `YYYYQn` of a date
#[must_use]
pub fn vintage(date: NaiveDate) -> String {
    format!("{}Q{}", date.year(), date.month0() / 3 + 1)
}

/// Hash bucket of an id
///
/// Reads up to 8 bytes starting at byte 4 as a little-endian integer and sums
/// the positions of its set bits.
#[must_use]
pub fn bucket(id: &str, buckets: u32) -> i32 {
    if buckets == 0 {
        return 0;
    }
    let bytes = id.as_bytes().get(4..).unwrap_or_default();
    let mut word = [0_u8; 8];
    let take = bytes.len().min(8);
    word[..take].copy_from_slice(&bytes[..take]);
    let bits = u64::from_le_bytes(word);
    let sum: u32 = (0..64).filter(|b| (bits >> b) & 1 == 1).sum();
    (sum % buckets) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn age_counts_months_from_first_payment() {
        let rule = DerivedRule::AgeAtPeriod {
            from: "fpDt".into(),
            floor_year: 1990,
            missing: -1000,
        };
        let fp = Value::Date(date(2010, 1, 1));
        let periods = [date(2010, 1, 31), date(2010, 2, 28), date(2011, 1, 31)];
        let out = rule.compute("L1", &periods, &[Some(&fp)]);
        assert_eq!(out, Derived::Monthly(vec![Value::Int(0), Value::Int(1), Value::Int(12)]));
    }

    #[test]
    fn age_is_missing_for_old_or_absent_dates() {
        let rule = DerivedRule::AgeAtPeriod {
            from: "fpDt".into(),
            floor_year: 1990,
            missing: -1000,
        };
        let old = Value::Date(date(1985, 6, 1));
        let periods = [date(2010, 1, 31)];
        assert_eq!(rule.compute("L1", &periods, &[Some(&old)]), Derived::Monthly(vec![Value::Int(-1000)]));
        assert_eq!(rule.compute("L1", &periods, &[None]), Derived::Monthly(vec![Value::Int(-1000)]));
    }

    #[test]
    fn vintage_is_year_and_quarter() {
        assert_eq!(vintage(date(2004, 3, 1)), "2004Q1");
        assert_eq!(vintage(date(2004, 7, 1)), "2004Q3");
        assert_eq!(vintage(date(2004, 12, 1)), "2004Q4");

        let rule = DerivedRule::Vintage {
            from: "fpDt".into(),
            missing: "!".into(),
        };
        assert_eq!(rule.compute("L1", &[], &[None]), Derived::Scalar(Value::from("!")));
    }

    #[test]
    fn origination_value_divides_by_ltv() {
        let rule = DerivedRule::OriginationValue {
            balance: "opb".into(),
            ratio: "ltv".into(),
            missing: -1.0,
        };
        let opb = Value::Float(200_000.0);
        let ltv = Value::Float(80.0);
        assert_eq!(
            rule.compute("L1", &[], &[Some(&opb), Some(&ltv)]),
            Derived::Scalar(Value::Float(250_000.0))
        );
        let zero = Value::Float(0.0);
        assert_eq!(
            rule.compute("L1", &[], &[Some(&opb), Some(&zero)]),
            Derived::Scalar(Value::Float(-1.0))
        );
        assert_eq!(rule.compute("L1", &[], &[Some(&opb), None]), Derived::Scalar(Value::Float(-1.0)));
    }

    #[test]
    fn contains_flag_ignores_case() {
        let rule = DerivedRule::ContainsFlag {
            from: "file".into(),
            needle: "harp".into(),
        };
        let harp = Value::from("HARP_2012Q1.txt");
        let plain = Value::from("2012Q1.txt");
        assert_eq!(rule.compute("L1", &[], &[Some(&harp)]), Derived::Scalar(Value::from("Y")));
        assert_eq!(rule.compute("L1", &[], &[Some(&plain)]), Derived::Scalar(Value::from("N")));
    }

    #[test]
    fn bucket_sums_set_bit_positions() {
        // byte 4 is 0x01 (bit 0), byte 5 is 0x03 (bits 8 and 9)
        let id = "abcd\u{1}\u{3}";
        assert_eq!(bucket(id, 20), 17);
        assert_eq!(bucket("abc", 20), 0);
        assert_eq!(bucket(id, 0), 0);

        let b = bucket("100012345678", 20);
        assert!((0..20).contains(&b));
        assert_eq!(b, bucket("100012345678", 20));
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let spec: DerivedSpec =
            serde_json::from_str(r#"{"name": "ageFpDt", "derive": "age_at_period", "from": "fpDt"}"#).unwrap();
        assert_eq!(
            spec.rule,
            DerivedRule::AgeAtPeriod {
                from: "fpDt".into(),
                floor_year: 1990,
                missing: -1000
            }
        );
        let spec: DerivedSpec = serde_json::from_str(r#"{"name": "bucket", "derive": "bucket"}"#).unwrap();
        assert_eq!(spec.rule, DerivedRule::Bucket { buckets: 20 });
    }
}
