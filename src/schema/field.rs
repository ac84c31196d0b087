//! Declaration of one source field

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationPolicy, Sentinel};
use crate::model::{FieldKind, Value};
use crate::qa::QaMode;

/// What happens to a source field when a loan is collapsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Kept as a per-period sequence
    Monthly,
    /// Reduced to one value
    Static(AggregationPolicy),
    /// Not written; not QA-reported unless a QA mode is set
    Excluded,
}

/// A source field: name, type, missing sentinel and role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Column name in the source and the output
    pub name: String,
    /// Declared type
    pub kind: FieldKind,
    /// Value meaning "not reported"
    pub missing: Value,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Monthly, static or excluded
    pub role: FieldRole,
    /// QA folding; defaults from the role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaMode>,
    /// Further codes treated as missing by aggregation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_missing: Vec<Value>,
    /// Lowercase string values of a monthly field
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lowercase: bool,
}

impl FieldSpec {
    fn new(name: impl Into<String>, kind: FieldKind, missing: impl Into<Value>, role: FieldRole) -> Self {
        Self {
            name: name.into(),
            kind,
            missing: missing.into(),
            description: String::new(),
            role,
            qa: None,
            also_missing: Vec::new(),
            lowercase: false,
        }
    }

    /// A field kept month by month
    pub fn monthly(name: impl Into<String>, kind: FieldKind, missing: impl Into<Value>) -> Self {
        Self::new(name, kind, missing, FieldRole::Monthly)
    }

    /// A field reduced to one value with `policy`
    pub fn fixed(
        name: impl Into<String>,
        kind: FieldKind,
        missing: impl Into<Value>,
        policy: AggregationPolicy,
    ) -> Self {
        Self::new(name, kind, missing, FieldRole::Static(policy))
    }

    /// A field that is only checked, never written
    pub fn excluded(name: impl Into<String>, kind: FieldKind, missing: impl Into<Value>) -> Self {
        Self::new(name, kind, missing, FieldRole::Excluded)
    }

    /// Attach a description
    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Override the QA mode implied by the role
    #[must_use]
    pub fn with_qa(mut self, mode: QaMode) -> Self {
        self.qa = Some(mode);
        self
    }

    /// Treat further codes as missing
    #[must_use]
    pub fn also_missing<I, V>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.also_missing.extend(codes.into_iter().map(Into::into));
        self
    }

    /// Lowercase the values of a monthly string field
    #[must_use]
    pub fn lowercased(mut self) -> Self {
        self.lowercase = true;
        self
    }

    /// Effective QA mode
    #[must_use]
    pub const fn qa_mode(&self) -> QaMode {
        match (self.qa, &self.role) {
            (Some(mode), _) => mode,
            (None, FieldRole::Monthly) => QaMode::Monthly,
            (None, FieldRole::Static(_)) => QaMode::Static,
            (None, FieldRole::Excluded) => QaMode::Excluded,
        }
    }

    /// Missing values used by aggregation
    #[must_use]
    pub fn sentinel(&self) -> Sentinel<'_> {
        Sentinel::new(&self.missing).with_also(&self.also_missing)
    }

    /// Aggregation policy of a static field
    #[must_use]
    pub const fn policy(&self) -> Option<&AggregationPolicy> {
        match &self.role {
            FieldRole::Static(policy) => Some(policy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qa_mode_follows_role_unless_overridden() {
        let upb = FieldSpec::monthly("upb", FieldKind::Float, -1.0_f32);
        assert_eq!(upb.qa_mode(), QaMode::Monthly);

        let fico = FieldSpec::fixed("fico", FieldKind::Int, -1, AggregationPolicy::Mean);
        assert_eq!(fico.qa_mode(), QaMode::Static);

        let fico = fico.with_qa(QaMode::Monthly);
        assert_eq!(fico.qa_mode(), QaMode::Monthly);

        let pay = FieldSpec::excluded("payHist", FieldKind::Str, "X");
        assert_eq!(pay.qa_mode(), QaMode::Excluded);
    }

    #[test]
    fn sentinel_includes_extra_codes() {
        let alt = FieldSpec::fixed("altRes", FieldKind::Str, "X", AggregationPolicy::First).also_missing(["7", "9"]);
        let sentinel = alt.sentinel();
        assert!(!sentinel.is_valid(&Value::from("7")));
        assert!(!sentinel.is_valid(&Value::from("X")));
        assert!(sentinel.is_valid(&Value::from("P")));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "name": "channel",
            "kind": "str",
            "missing": "X",
            "role": {"static": {"policy": "mode"}}
        }"#;
        let spec: FieldSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.policy(), Some(&AggregationPolicy::Mode));
        assert_eq!(spec.qa_mode(), QaMode::Static);

        let json = r#"{"name": "servicer", "kind": "str", "missing": "unknown", "role": "monthly", "lowercase": true}"#;
        let spec: FieldSpec = serde_json::from_str(json).unwrap();
        assert!(spec.lowercase);
        assert_eq!(spec.role, FieldRole::Monthly);
    }
}
