//! Field declarations of the monthly loan performance dataset
//!
//! Descriptions omit the sentinel; the catalog appends it.

use chrono::NaiveDate;

use super::field::FieldSpec;
use super::plan::SourceSchema;
use crate::aggregate::AggregationPolicy;
use crate::derive::{DerivedRule, DerivedSpec};
use crate::model::{FieldKind, Value};

/// Years at or before this are not plausible event dates
const DATE_FLOOR_YEAR: i32 = 1970;

fn missing_date() -> Value {
    Value::Date(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default())
}

fn float(name: &str, missing: f32, description: &str) -> FieldSpec {
    FieldSpec::monthly(name, FieldKind::Float, missing).described(description)
}

fn int(name: &str, description: &str) -> FieldSpec {
    FieldSpec::monthly(name, FieldKind::Int, -1).described(description)
}

fn code(name: &str, missing: &str, description: &str) -> FieldSpec {
    FieldSpec::monthly(name, FieldKind::Str, missing).described(description)
}

fn first(name: &str, missing: &str, description: &str) -> FieldSpec {
    FieldSpec::fixed(name, FieldKind::Str, missing, AggregationPolicy::First).described(description)
}

fn mean(name: &str, kind: FieldKind, description: &str) -> FieldSpec {
    FieldSpec::fixed(name, kind, -1, AggregationPolicy::Mean).described(description)
}

fn date(name: &str, description: &str) -> FieldSpec {
    FieldSpec::fixed(
        name,
        FieldKind::Date,
        missing_date(),
        AggregationPolicy::FirstAfter {
            min_year: DATE_FLOOR_YEAR,
        },
    )
    .described(description)
}

fn max(name: &str, missing: f32, description: &str) -> FieldSpec {
    FieldSpec::fixed(name, FieldKind::Float, missing, AggregationPolicy::Max).described(description)
}

fn leading(name: &str, missing: &str, description: &str) -> FieldSpec {
    FieldSpec::fixed(name, FieldKind::Str, missing, AggregationPolicy::Leading).described(description)
}

/// Source fields, monthly first, in output order
#[must_use]
pub fn loan_fields() -> Vec<FieldSpec> {
    vec![
        float("upb", -1.0, "unpaid balance"),
        int("dq", "months delinquent"),
        code("servicer", "unknown", "name of servicer").lowercased(),
        float("curRate", -1.0, "current note rate"),
        int("age", "loan age based on origination date"),
        int("rTermLgl", "remaining legal term"),
        int("rTermAct", "remaining actual term"),
        code("dqStat", "!", "DQ status code: 0-99 months"),
        code("mod", "X", "modification flag: Y, N"),
        code(
            "zb",
            "X",
            "zero balance:00(noop), 01(pp), 03(short), 06(repurch), 09(REO), 96/97/98(removal), 02/15/16(sale)",
        ),
        int("ioRem", "number of IO months remaining"),
        code(
            "bap",
            "X",
            "borrower assistant plan: F(forebearance), R(repayment), T(trial), O(Other), N(none), 7,9(NA)",
        ),
        code("program", "X", "fannie program: Y (home ready) N (no program)"),
        float("nonIntUpb", -1.0, "interest bearing UPB"),
        float("frgvUpb", -1.0, "forgiven UPB"),
        float("totPrin", 0.0, "delta upb"),
        code("servAct", "X", "servicing activity: Y, N"),
        FieldSpec::monthly("matDt", FieldKind::Date, missing_date()).described("loan maturity date (initial)"),
        first("channel", "X", "acquisition channel: B, R, C"),
        first("seller", "unknown", "name of seller"),
        mean("dti", FieldKind::Float, "dti at origination, 1-65"),
        mean("rate", FieldKind::Float, "note rate at origination, 0-15"),
        mean("opb", FieldKind::Float, "balance at origination"),
        mean("term", FieldKind::Float, "loan term at origination"),
        date("origDt", "origination date"),
        date("fpDt", "first payment date"),
        mean("ltv", FieldKind::Float, "ltv at origination, 1-998"),
        mean("cltv", FieldKind::Float, "combined cltv at origination, 1-998"),
        mean("numBorr", FieldKind::Int, "number of borrowers, 1-10"),
        mean("fico", FieldKind::Int, "fico at origination, 301-850"),
        mean("coFico", FieldKind::Int, "coborrower fico at origination, 301-850"),
        first("firstTime", "X", "first time homebuyer: Y, N"),
        first(
            "purpose",
            "X",
            "loan purpose: P (purch), C (cash out refi), U (rate/term refi) R (refi)",
        ),
        first(
            "propType",
            "XX",
            "property type: SF (single family), CO (condo), PU (PUD), CP (coop), MH (manufactured)",
        ),
        mean("units", FieldKind::Float, "# of units in the property, 1-4"),
        first("occ", "X", "property occupancy: P (primary), S (secondary), I (investor)"),
        first("state", "XX", "property state postal abbreviation"),
        first("msa", "XXXXX", "msa/division code, not in MSA=00000"),
        first("zip3", "000", "3-digit zip"),
        mean("mi", FieldKind::Float, "mi percentage, 0-55"),
        first("amType", "XXX", "amortization type: FRM, ARM"),
        FieldSpec::fixed("pPen", FieldKind::Str, "X", AggregationPolicy::any_yes())
            .described("prepay penalty flag: Y, N"),
        first("io", "X", "io Flag: Y, N"),
        date("ioDt", "month IO loan starts amortizing"),
        date("zbDt", "zero balance date"),
        max("zbUpb", -1.0, "UPB just prior to zero balance"),
        date("lpDt", "last pay date"),
        date("fclDt", "foreclosure date"),
        date("dispDt", "date Fannie is done with loan"),
        max("fclExp", 0.0, "total foreclosure expenses"),
        max("fclPExp", -1.0, "foreclosure property preservation expenses"),
        max("fclLExp", -1.0, "foreclosure recovery legal expenses"),
        max("fclMExp", -1.0, "foreclosure misc expenses"),
        max("fclTaxes", -1.0, "foreclosure property taxes and insurance"),
        max("fclProNet", -1.0, "foreclosure net proceeds"),
        max("fclProMi", -1.0, "foreclosure credit enhancement proceeds"),
        max("fclProMw", -1.0, "foreclosure make whole proceeds"),
        max("fclProOth", -1.0, "foreclosure other proceeds"),
        mean("fclWriteOff", FieldKind::Float, "foreclosure principal writeoff"),
        first("miType", "X", "mi type: 1=borrower, 2=lender, 3=enterprise, 0=No MI"),
        first("relo", "X", "relocation mortgage: Y, N"),
        first(
            "valMthd",
            "X",
            "property value method A(apprsl), P(onsite), R(GSE target), W(waived), O(other)",
        ),
        first("sConform", "X", "super conforming flag: Y, N"),
        first("hltv", "X", "high LTV refi"),
        FieldSpec::fixed("reprchMw", FieldKind::Str, "X", AggregationPolicy::any_yes())
            .described("repurchase make whole: Y, N"),
        first("altRes", "X", "DQ payment deferral: P(payment), C(Covid), D(disaster), 7/9 :NA").also_missing(["7", "9"]),
        mean("altResCnt", FieldKind::Int, "# of alternate resolutions (deferrals)"),
        mean("totDefrl", FieldKind::Float, "total amount deferred"),
        leading("file", "!", "source file"),
        leading("standard", "X", "standard u/w process loan: Y, N"),
        leading("nsDoc", "X", "non-standard documentation: Y, N"),
        leading("nsUw", "X", "non-standard underwriting: Y, N"),
        leading("gGuar", "X", "government issued/guaranteed: Y, N"),
        leading("negAm", "X", "loan can neg am: Y, N"),
        FieldSpec::excluded("mServicer", FieldKind::Str, "unknown").described("name of master servicer"),
        FieldSpec::excluded("payHist", FieldKind::Str, "X").described("24 month pay history (oldest on left)"),
    ]
}

/// Columns computed after aggregation
#[must_use]
pub fn loan_derived() -> Vec<DerivedSpec> {
    vec![
        DerivedSpec::new(
            "ageFpDt",
            DerivedRule::AgeAtPeriod {
                from: "fpDt".to_string(),
                floor_year: 1990,
                missing: -1000,
            },
        )
        .described("age based on fpDt"),
        DerivedSpec::new(
            "vintage",
            DerivedRule::Vintage {
                from: "fpDt".to_string(),
                missing: "!".to_string(),
            },
        )
        .described("vintage (from fpDt)"),
        DerivedSpec::new(
            "propVal",
            DerivedRule::OriginationValue {
                balance: "opb".to_string(),
                ratio: "ltv".to_string(),
                missing: -1.0,
            },
        )
        .described("property value at origination"),
        DerivedSpec::new(
            "harp",
            DerivedRule::ContainsFlag {
                from: "file".to_string(),
                needle: "harp".to_string(),
            },
        )
        .described("loan is HARP: Y, N"),
        DerivedSpec::new("bucket", DerivedRule::Bucket { buckets: 20 }).described("hash bucket of lnId, 0-19"),
    ]
}

/// Full declaration of the loan performance dataset
#[must_use]
pub fn loan_schema() -> SourceSchema {
    SourceSchema::new(loan_fields()).with_derived(loan_derived())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CollapsePlan;

    #[test]
    fn loan_schema_compiles() {
        let plan = CollapsePlan::compile(loan_schema()).unwrap();
        let output = plan.output();
        assert_eq!(output.fields()[0].name, "lnId");
        assert_eq!(output.fields()[1].name, "month");
        assert!(output.field("payHist").is_none());
        assert!(output.field("ageFpDt").is_some());
        assert_eq!(output.fields().last().map(|f| f.name.as_str()), Some("allFail"));
    }

    #[test]
    fn catalog_documents_sentinels() {
        let plan = CollapsePlan::compile(loan_schema()).unwrap();
        let catalog = plan.output().catalog();
        assert!(catalog.contains("fpDt"));
        assert!(catalog.contains("first payment date, missing=1970/1/1"));
        assert!(catalog.contains("Array(Float32)"));
    }
}
