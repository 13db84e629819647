//! Serialized contract format
//!
//! These types mirror the JSON contract file one-to-one. They are validated and
//! compiled into [`super::Contract`] before any document is processed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContractSpec {
    pub target_schema: String,
    pub root: RootSpec,
    pub table_insertion_order: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSpec>,
    #[serde(default)]
    pub element_filter_rules: Vec<ElementFilterRule>,
    #[serde(default)]
    pub key_identifiers: Vec<KeyIdentifierSpec>,
    #[serde(default)]
    pub enum_tables: BTreeMap<String, EnumTable>,
    #[serde(default)]
    pub bit_conversions: BTreeMap<String, BitConversion>,
    pub column_rules: Vec<ColumnRuleSpec>,
}

/// Where the root record lives and how it is identified
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RootSpec {
    pub table: String,
    /// Absolute path of the element carrying the root identifier
    pub element_path: String,
    pub identifier_attribute: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub key_column: Option<String>,
    /// The store assigns the key on insert; no column rule may target it
    #[serde(default)]
    pub generated_key: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipSpec {
    pub parent_table: String,
    pub child_table: String,
    pub foreign_key_column: String,
    /// Sub-element path relative to the parent's scope element. Absent means
    /// the child row is built from the parent's own element.
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub element_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    #[default]
    Skippable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ElementFilterRule {
    pub element_type: String,
    pub discriminator: String,
    #[serde(default)]
    pub valid_values: Vec<String>,
    #[serde(default)]
    pub identity_attribute: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl ElementFilterRule {
    /// An empty value set accepts any present discriminator
    pub fn accepts(&self, value: &str) -> bool {
        self.valid_values.is_empty() || self.valid_values.iter().any(|v| v == value)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeyIdentifierSpec {
    pub name: String,
    pub element_type: String,
    pub attribute: String,
    /// Preference order; the first discriminator value with a match wins
    #[serde(default)]
    pub discriminator_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnumTable {
    pub values: BTreeMap<String, i64>,
    /// Used for unmapped text when present
    #[serde(default)]
    pub default: Option<i64>,
    /// Unmapped text without a default is a column issue instead of an omission
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BitConversion {
    pub truthy: Vec<String>,
    pub falsy: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Omit,
    Abandon,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnRuleSpec {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub transforms: Vec<TransformStepSpec>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

/// Attribute or element text at a path relative to the scope element
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformStepSpec {
    #[serde(flatten)]
    pub op: StepSpec,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepSpec {
    Coerce(CoercionSpec),
    Enum {
        enum_type: String,
    },
    Bit {
        conversion: String,
    },
    Calculated {
        expression: String,
    },
    Copy {
        #[serde(default)]
        key_identifier: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        attribute: Option<String>,
    },
    Field {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        attribute: Option<String>,
    },
    Literal {
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Text,
    Int,
    Decimal,
    Bool,
    Date,
    Datetime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    #[default]
    Truncate,
    HalfUp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoercionSpec {
    pub to: TargetType,
    #[serde(default)]
    pub scale: Option<i64>,
    #[serde(default)]
    pub rounding: Rounding,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min: Option<serde_json::Number>,
    #[serde(default)]
    pub max: Option<serde_json::Number>,
    /// chrono format strings tried in order for date and datetime targets
    #[serde(default)]
    pub formats: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_spec_tagged_by_op() {
        let step: TransformStepSpec = serde_json::from_value(serde_json::json!({
            "op": "coerce",
            "to": "decimal",
            "scale": 2,
            "rounding": "half_up",
            "fallback": false
        }))
        .unwrap();
        match step.op {
            StepSpec::Coerce(spec) => {
                assert_eq!(spec.to, TargetType::Decimal);
                assert_eq!(spec.scale, Some(2));
                assert_eq!(spec.rounding, Rounding::HalfUp);
            }
            other => panic!("unexpected step {other:?}"),
        }

        let fallback: TransformStepSpec = serde_json::from_value(serde_json::json!({
            "op": "calculated",
            "expression": "'X'",
            "fallback": true
        }))
        .unwrap();
        assert!(fallback.fallback);
    }

    #[test]
    fn test_column_rule_defaults() {
        let rule: ColumnRuleSpec = serde_json::from_value(serde_json::json!({
            "table": "app_base",
            "column": "app_id"
        }))
        .unwrap();
        assert!(rule.nullable);
        assert_eq!(rule.on_error, ErrorPolicy::Omit);
        assert!(rule.transforms.is_empty());
    }

    #[test]
    fn test_filter_rule_accepts() {
        let rule = ElementFilterRule {
            element_type: "contact".to_string(),
            discriminator: "ac_role_tp_c".to_string(),
            valid_values: vec!["PR".to_string(), "AUTHU".to_string()],
            identity_attribute: None,
            severity: Severity::Skippable,
        };
        assert!(rule.accepts("PR"));
        assert!(!rule.accepts("pr"));
    }
}
