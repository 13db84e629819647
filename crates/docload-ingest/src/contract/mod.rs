//! Mapping contract
//!
//! The contract declares how a staged document maps onto target tables. It is
//! loaded from JSON once per run, validated, compiled (paths parsed, calculated
//! expressions parsed, literals typed) and then shared read-only behind an
//! `Arc` by every worker.

pub mod model;

use bigdecimal::BigDecimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::document::ElementPath;
use crate::error::ContractError;
use crate::expression::Expr;
use crate::value::{Value, MAX_DECIMAL_EXPONENT};

pub use model::{
    BitConversion, ContractSpec, ElementFilterRule, EnumTable, ErrorPolicy, KeyIdentifierSpec,
    Rounding, Severity, TargetType,
};

use model::{ColumnRuleSpec, StepSpec};

/// Root record location
#[derive(Debug, Clone)]
pub struct RootRule {
    pub table: String,
    pub element_path: ElementPath,
    pub identifier_attribute: String,
}

/// Parent/child link between two target tables
#[derive(Debug, Clone)]
pub struct Relationship {
    pub parent_table: String,
    pub child_table: String,
    pub foreign_key_column: String,
    pub source_path: Option<ElementPath>,
    pub element_type: Option<String>,
}

/// Extraction source of a column rule
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub path: ElementPath,
    /// Element text is used when no attribute is named
    pub attribute: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Coercion {
    pub to: TargetType,
    pub scale: Option<i64>,
    pub rounding: Rounding,
    pub max_length: Option<usize>,
    pub min: Option<BigDecimal>,
    pub max: Option<BigDecimal>,
    pub formats: Vec<String>,
}

/// One compiled transform step
#[derive(Debug, Clone)]
pub enum StepKind {
    Coerce(Coercion),
    Enum(String),
    Bit(String),
    Calculated(Expr),
    Copy {
        key_identifier: Option<String>,
        source: SourceRef,
    },
    Field(SourceRef),
    Literal(Value),
}

impl StepKind {
    /// Producers supply a value on their own; the others reshape the current one
    pub fn is_producer(&self) -> bool {
        matches!(
            self,
            StepKind::Calculated(_)
                | StepKind::Copy { .. }
                | StepKind::Field(_)
                | StepKind::Literal(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Coerce(_) => "coerce",
            StepKind::Enum(_) => "enum",
            StepKind::Bit(_) => "bit",
            StepKind::Calculated(_) => "calculated",
            StepKind::Copy { .. } => "copy",
            StepKind::Field(_) => "field",
            StepKind::Literal(_) => "literal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformStep {
    pub kind: StepKind,
    pub fallback: bool,
}

/// Compiled rule for one target column
#[derive(Debug, Clone)]
pub struct ColumnRule {
    pub table: String,
    pub column: String,
    pub source: Option<SourceRef>,
    pub steps: Vec<TransformStep>,
    pub nullable: bool,
    pub default: Option<Value>,
    pub on_error: ErrorPolicy,
}

#[derive(Debug, Clone)]
struct TableInfo {
    key_column: Option<String>,
    generated_key: bool,
}

/// Outcome of an enum lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumLookup {
    Mapped(i64),
    Defaulted(i64),
    /// Unmapped text on an optional enum; the column is omitted
    Unmapped,
    /// Unmapped text on a required enum without a default
    Rejected,
}

/// Counts printed by `validate-contract`
#[derive(Debug, Clone, Serialize)]
pub struct ContractSummary {
    pub target_schema: String,
    pub root_table: String,
    pub table_insertion_order: Vec<String>,
    pub column_rules_per_table: BTreeMap<String, usize>,
    pub relationships: usize,
    pub element_filter_rules: usize,
    pub key_identifiers: usize,
    pub enum_tables: usize,
    pub bit_conversions: usize,
    pub calculated_columns: usize,
}

/// Validated, immutable mapping contract
#[derive(Debug, Clone)]
pub struct Contract {
    target_schema: String,
    root: RootRule,
    insertion_order: Vec<String>,
    tables: HashMap<String, TableInfo>,
    relationships: Vec<Relationship>,
    filter_rules: HashMap<String, ElementFilterRule>,
    key_identifiers: Vec<KeyIdentifierSpec>,
    enum_tables: BTreeMap<String, EnumTable>,
    bit_conversions: BTreeMap<String, BitConversion>,
    columns: HashMap<String, Vec<ColumnRule>>,
}

impl Contract {
    /// Read and validate a contract file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ContractError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ContractError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let contract = Self::from_json(&text)?;
        debug!(
            path = %path.display(),
            tables = contract.insertion_order.len(),
            "Loaded mapping contract"
        );
        Ok(contract)
    }

    pub fn from_json(text: &str) -> Result<Self, ContractError> {
        let spec: ContractSpec = serde_json::from_str(text)?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: ContractSpec) -> Result<Self, ContractError> {
        validate_identifier("target schema", &spec.target_schema)?;

        let insertion_order = spec.table_insertion_order.clone();
        let mut seen = HashSet::new();
        for table in &insertion_order {
            validate_identifier("table", table)?;
            if !seen.insert(table.as_str()) {
                return Err(ContractError::invalid(format!(
                    "table {table} appears twice in table_insertion_order"
                )));
            }
        }
        if insertion_order.first() != Some(&spec.root.table) {
            return Err(ContractError::invalid(format!(
                "root table {} must come first in table_insertion_order",
                spec.root.table
            )));
        }

        let root_path = ElementPath::parse(&spec.root.element_path);
        if !root_path.is_absolute() || root_path.segments().is_empty() {
            return Err(ContractError::invalid(format!(
                "root element_path '{}' must be an absolute path",
                spec.root.element_path
            )));
        }

        let position: HashMap<&str, usize> = insertion_order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();
        let require_known = |what: &str, table: &str| -> Result<(), ContractError> {
            if position.contains_key(table) {
                Ok(())
            } else {
                Err(ContractError::invalid(format!(
                    "{what} references table {table}, which is not in table_insertion_order"
                )))
            }
        };

        let mut tables: HashMap<String, TableInfo> = insertion_order
            .iter()
            .map(|t| {
                (
                    t.clone(),
                    TableInfo {
                        key_column: None,
                        generated_key: false,
                    },
                )
            })
            .collect();
        for table in &spec.tables {
            require_known("tables", &table.name)?;
            if let Some(key) = &table.key_column {
                validate_identifier("key column", key)?;
            } else if table.generated_key {
                return Err(ContractError::invalid(format!(
                    "table {} has a generated key but no key_column",
                    table.name
                )));
            }
            tables.insert(
                table.name.clone(),
                TableInfo {
                    key_column: table.key_column.clone(),
                    generated_key: table.generated_key,
                },
            );
        }

        let filter_rules: HashMap<String, ElementFilterRule> = spec
            .element_filter_rules
            .iter()
            .map(|rule| {
                if rule.discriminator.trim().is_empty() {
                    Err(ContractError::invalid(format!(
                        "filter rule for {} has no discriminator attribute",
                        rule.element_type
                    )))
                } else {
                    Ok((rule.element_type.clone(), rule.clone()))
                }
            })
            .collect::<Result<_, _>>()?;

        let mut relationships = Vec::with_capacity(spec.relationships.len());
        let mut parent_of: HashMap<&str, &str> = HashMap::new();
        for rel in &spec.relationships {
            require_known("relationship", &rel.parent_table)?;
            require_known("relationship", &rel.child_table)?;
            validate_identifier("foreign key column", &rel.foreign_key_column)?;
            if position[rel.parent_table.as_str()] >= position[rel.child_table.as_str()] {
                return Err(ContractError::invalid(format!(
                    "parent table {} must precede child table {} in table_insertion_order",
                    rel.parent_table, rel.child_table
                )));
            }
            if parent_of
                .insert(rel.child_table.as_str(), rel.parent_table.as_str())
                .is_some()
            {
                return Err(ContractError::invalid(format!(
                    "table {} has more than one parent relationship",
                    rel.child_table
                )));
            }
            if tables
                .get(&rel.parent_table)
                .and_then(|t| t.key_column.as_ref())
                .is_none()
            {
                return Err(ContractError::invalid(format!(
                    "parent table {} needs a key_column to link {}",
                    rel.parent_table, rel.child_table
                )));
            }
            if let Some(element_type) = &rel.element_type {
                if !filter_rules.contains_key(element_type) {
                    return Err(ContractError::invalid(format!(
                        "relationship {} -> {} uses element type {element_type} without a filter rule",
                        rel.parent_table, rel.child_table
                    )));
                }
            }
            relationships.push(Relationship {
                parent_table: rel.parent_table.clone(),
                child_table: rel.child_table.clone(),
                foreign_key_column: rel.foreign_key_column.clone(),
                source_path: rel.source_path.as_deref().map(ElementPath::parse),
                element_type: rel.element_type.clone(),
            });
        }

        for table in insertion_order.iter().skip(1) {
            if !parent_of.contains_key(table.as_str()) {
                return Err(ContractError::invalid(format!(
                    "child table {table} has no relationship entry"
                )));
            }
        }
        if parent_of.contains_key(spec.root.table.as_str()) {
            return Err(ContractError::invalid(format!(
                "root table {} cannot be a relationship child",
                spec.root.table
            )));
        }

        let mut key_names = HashSet::new();
        for key in &spec.key_identifiers {
            if !filter_rules.contains_key(&key.element_type) {
                return Err(ContractError::invalid(format!(
                    "key identifier {} uses element type {} without a filter rule",
                    key.name, key.element_type
                )));
            }
            if !key_names.insert(key.name.as_str()) {
                return Err(ContractError::invalid(format!(
                    "key identifier {} is declared twice",
                    key.name
                )));
            }
        }

        let mut columns: HashMap<String, Vec<ColumnRule>> = HashMap::new();
        let mut declared: HashSet<(String, String)> = HashSet::new();
        for spec_rule in &spec.column_rules {
            require_known("column rule", &spec_rule.table)?;
            validate_identifier("column", &spec_rule.column)?;
            if !declared.insert((spec_rule.table.clone(), spec_rule.column.clone())) {
                return Err(ContractError::invalid(format!(
                    "duplicate column rule for {}.{}",
                    spec_rule.table, spec_rule.column
                )));
            }
            let info = &tables[&spec_rule.table];
            if info.generated_key && info.key_column.as_deref() == Some(spec_rule.column.as_str())
            {
                return Err(ContractError::invalid(format!(
                    "{}.{} is store-generated and cannot have a column rule",
                    spec_rule.table, spec_rule.column
                )));
            }
            if relationships.iter().any(|r| {
                r.child_table == spec_rule.table && r.foreign_key_column == spec_rule.column
            }) {
                return Err(ContractError::invalid(format!(
                    "{}.{} is populated from its parent relationship",
                    spec_rule.table, spec_rule.column
                )));
            }

            let rule = compile_rule(spec_rule, &spec, &key_names)?;
            columns.entry(rule.table.clone()).or_default().push(rule);
        }

        Ok(Self {
            target_schema: spec.target_schema,
            root: RootRule {
                table: spec.root.table,
                element_path: root_path,
                identifier_attribute: spec.root.identifier_attribute,
            },
            insertion_order,
            tables,
            relationships,
            filter_rules,
            key_identifiers: spec.key_identifiers,
            enum_tables: spec.enum_tables,
            bit_conversions: spec.bit_conversions,
            columns,
        })
    }

    pub fn target_schema(&self) -> &str {
        &self.target_schema
    }

    pub fn root(&self) -> &RootRule {
        &self.root
    }

    pub fn insertion_order(&self) -> &[String] {
        &self.insertion_order
    }

    /// Position of a table in the insertion order
    pub fn table_position(&self, table: &str) -> Option<usize> {
        self.insertion_order.iter().position(|t| t == table)
    }

    pub fn key_column_for(&self, table: &str) -> Option<&str> {
        self.tables
            .get(table)
            .and_then(|t| t.key_column.as_deref())
    }

    pub fn has_generated_key(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|t| t.generated_key)
    }

    pub fn relationship_for(&self, child_table: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|r| r.child_table == child_table)
    }

    /// Source sub-element path of a child table, relative to its parent scope
    pub fn child_path_for(&self, child_table: &str) -> Option<&ElementPath> {
        self.relationship_for(child_table)
            .and_then(|r| r.source_path.as_ref())
    }

    pub fn children_of<'a>(&'a self, parent_table: &'a str) -> impl Iterator<Item = &'a Relationship> {
        self.relationships
            .iter()
            .filter(move |r| r.parent_table == parent_table)
    }

    pub fn filter_rule_for(&self, element_type: &str) -> Option<&ElementFilterRule> {
        self.filter_rules.get(element_type)
    }

    pub fn key_identifiers(&self) -> &[KeyIdentifierSpec] {
        &self.key_identifiers
    }

    pub fn column_rules_for(&self, table: &str) -> &[ColumnRule] {
        self.columns.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Integer code for `text`, or `None` when the column should be omitted.
    /// Required enums without a default are rejected through [`Self::lookup_enum`].
    pub fn enum_value(&self, enum_type: &str, text: &str) -> Option<i64> {
        match self.lookup_enum(enum_type, text) {
            EnumLookup::Mapped(v) | EnumLookup::Defaulted(v) => Some(v),
            EnumLookup::Unmapped | EnumLookup::Rejected => None,
        }
    }

    pub fn lookup_enum(&self, enum_type: &str, text: &str) -> EnumLookup {
        let Some(table) = self.enum_tables.get(enum_type) else {
            return EnumLookup::Rejected;
        };
        if let Some(v) = table.values.get(text.trim()) {
            return EnumLookup::Mapped(*v);
        }
        match (table.default, table.required) {
            (Some(default), _) => EnumLookup::Defaulted(default),
            (None, true) => EnumLookup::Rejected,
            (None, false) => EnumLookup::Unmapped,
        }
    }

    /// 1 for truthy tokens, 0 for falsy ones, `None` otherwise
    pub fn bit_value(&self, conversion: &str, text: &str) -> Option<i64> {
        let table = self.bit_conversions.get(conversion)?;
        let token = text.trim();
        if table.truthy.iter().any(|t| t.eq_ignore_ascii_case(token)) {
            Some(1)
        } else if table.falsy.iter().any(|t| t.eq_ignore_ascii_case(token)) {
            Some(0)
        } else {
            None
        }
    }

    pub fn summary(&self) -> ContractSummary {
        ContractSummary {
            target_schema: self.target_schema.clone(),
            root_table: self.root.table.clone(),
            table_insertion_order: self.insertion_order.clone(),
            column_rules_per_table: self
                .insertion_order
                .iter()
                .map(|t| (t.clone(), self.column_rules_for(t).len()))
                .collect(),
            relationships: self.relationships.len(),
            element_filter_rules: self.filter_rules.len(),
            key_identifiers: self.key_identifiers.len(),
            enum_tables: self.enum_tables.len(),
            bit_conversions: self.bit_conversions.len(),
            calculated_columns: self
                .columns
                .values()
                .flatten()
                .filter(|r| {
                    r.steps
                        .iter()
                        .any(|s| matches!(s.kind, StepKind::Calculated(_)))
                })
                .count(),
        }
    }
}

/// Names interpolated into SQL must be plain identifiers
pub fn validate_identifier(what: &str, name: &str) -> Result<(), ContractError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ContractError::invalid(format!(
            "{what} name '{name}' is not a valid identifier"
        )))
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn compile_source(path: Option<&str>, attribute: Option<&str>) -> SourceRef {
    SourceRef {
        path: ElementPath::parse(path.unwrap_or(".")),
        attribute: attribute.map(str::to_string),
    }
}

fn parse_bound(
    rule: &ColumnRuleSpec,
    bound: Option<&serde_json::Number>,
) -> Result<Option<BigDecimal>, ContractError> {
    bound
        .map(|n| {
            BigDecimal::from_str(&n.to_string()).map_err(|e| {
                ContractError::invalid(format!(
                    "{}.{} has an invalid range bound {n}: {e}",
                    rule.table, rule.column
                ))
            })
        })
        .transpose()
}

fn compile_rule(
    rule: &ColumnRuleSpec,
    spec: &ContractSpec,
    key_names: &HashSet<&str>,
) -> Result<ColumnRule, ContractError> {
    let mut steps = Vec::with_capacity(rule.transforms.len());

    for step in &rule.transforms {
        let kind = match &step.op {
            StepSpec::Coerce(c) => {
                if c.scale.is_some_and(|scale| scale.abs() > MAX_DECIMAL_EXPONENT) {
                    return Err(ContractError::invalid(format!(
                        "{}.{} has a coerce scale beyond {MAX_DECIMAL_EXPONENT}",
                        rule.table, rule.column
                    )));
                }
                StepKind::Coerce(Coercion {
                    to: c.to,
                    scale: c.scale,
                    rounding: c.rounding,
                    max_length: c.max_length,
                    min: parse_bound(rule, c.min.as_ref())?,
                    max: parse_bound(rule, c.max.as_ref())?,
                    formats: c.formats.clone(),
                })
            }
            StepSpec::Enum { enum_type } => {
                if !spec.enum_tables.contains_key(enum_type) {
                    return Err(ContractError::invalid(format!(
                        "{}.{} references unknown enum table {enum_type}",
                        rule.table, rule.column
                    )));
                }
                StepKind::Enum(enum_type.clone())
            }
            StepSpec::Bit { conversion } => {
                if !spec.bit_conversions.contains_key(conversion) {
                    return Err(ContractError::invalid(format!(
                        "{}.{} references unknown bit conversion {conversion}",
                        rule.table, rule.column
                    )));
                }
                StepKind::Bit(conversion.clone())
            }
            StepSpec::Calculated { expression } => {
                let expr = Expr::parse(expression).map_err(|e| ContractError::Expression {
                    table: rule.table.clone(),
                    column: rule.column.clone(),
                    message: e.to_string(),
                })?;
                StepKind::Calculated(expr)
            }
            StepSpec::Copy {
                key_identifier,
                path,
                attribute,
            } => {
                if let Some(name) = key_identifier {
                    if !key_names.contains(name.as_str()) {
                        return Err(ContractError::invalid(format!(
                            "{}.{} copies from unknown key identifier {name}",
                            rule.table, rule.column
                        )));
                    }
                }
                StepKind::Copy {
                    key_identifier: key_identifier.clone(),
                    source: compile_source(path.as_deref(), attribute.as_deref()),
                }
            }
            StepSpec::Field { path, attribute } => {
                StepKind::Field(compile_source(path.as_deref(), attribute.as_deref()))
            }
            StepSpec::Literal { value } => {
                let literal = Value::from_json(value).ok_or_else(|| {
                    ContractError::invalid(format!(
                        "{}.{} has a literal that is not a scalar",
                        rule.table, rule.column
                    ))
                })?;
                StepKind::Literal(literal)
            }
        };
        steps.push(TransformStep {
            kind,
            fallback: step.fallback,
        });
    }

    let default = match &rule.default {
        None | Some(serde_json::Value::Null) => None,
        Some(json) => Some(Value::from_json(json).ok_or_else(|| {
            ContractError::invalid(format!(
                "{}.{} has a default that is not a scalar",
                rule.table, rule.column
            ))
        })?),
    };

    Ok(ColumnRule {
        table: rule.table.clone(),
        column: rule.column.clone(),
        source: rule
            .source
            .as_ref()
            .map(|s| compile_source(s.path.as_deref(), s.attribute.as_deref())),
        steps,
        nullable: rule.nullable,
        default,
        on_error: rule.on_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_contract() -> serde_json::Value {
        json!({
            "target_schema": "dbo",
            "root": {
                "table": "app_base",
                "element_path": "/Provenir/Request",
                "identifier_attribute": "ID"
            },
            "table_insertion_order": ["app_base", "contact_base"],
            "tables": [
                { "name": "app_base", "key_column": "app_id" },
                { "name": "contact_base", "key_column": "con_id", "generated_key": true }
            ],
            "relationships": [{
                "parent_table": "app_base",
                "child_table": "contact_base",
                "foreign_key_column": "app_id",
                "source_path": "CustData/contact",
                "element_type": "contact"
            }],
            "element_filter_rules": [{
                "element_type": "contact",
                "discriminator": "ac_role_tp_c",
                "valid_values": ["PR", "AUTHU"]
            }],
            "enum_tables": {
                "contact_type": { "values": { "PR": 281, "AUTHU": 280 } },
                "app_source": { "values": { "I": 1 }, "default": 0, "required": true },
                "strict": { "values": { "A": 1 }, "required": true }
            },
            "bit_conversions": {
                "yes_no": { "truthy": ["Y", "1"], "falsy": ["N", "0"] }
            },
            "column_rules": [
                { "table": "app_base", "column": "app_ident", "source": { "attribute": "ID" } },
                {
                    "table": "contact_base",
                    "column": "contact_type_enum",
                    "source": { "attribute": "ac_role_tp_c" },
                    "transforms": [{ "op": "enum", "enum_type": "contact_type" }]
                }
            ]
        })
    }

    fn load(value: serde_json::Value) -> Result<Contract, ContractError> {
        Contract::from_json(&value.to_string())
    }

    #[test]
    fn test_valid_contract_loads() {
        let contract = load(base_contract()).unwrap();
        assert_eq!(contract.target_schema(), "dbo");
        assert_eq!(contract.root().table, "app_base");
        assert_eq!(contract.key_column_for("contact_base"), Some("con_id"));
        assert!(contract.has_generated_key("contact_base"));
        assert_eq!(
            contract.child_path_for("contact_base").map(|p| p.to_string()),
            Some("CustData/contact".to_string())
        );
        assert_eq!(contract.children_of("app_base").count(), 1);
        assert_eq!(contract.column_rules_for("contact_base").len(), 1);
        assert!(contract.column_rules_for("unknown").is_empty());
    }

    #[test]
    fn test_enum_lookup_modes() {
        let contract = load(base_contract()).unwrap();
        assert_eq!(contract.enum_value("contact_type", "PR"), Some(281));
        assert_eq!(contract.lookup_enum("contact_type", "XX"), EnumLookup::Unmapped);
        assert_eq!(contract.enum_value("contact_type", "XX"), None);
        assert_eq!(contract.lookup_enum("app_source", "Z"), EnumLookup::Defaulted(0));
        assert_eq!(contract.lookup_enum("strict", "Z"), EnumLookup::Rejected);
        assert_eq!(contract.enum_value("missing", "PR"), None);
    }

    #[test]
    fn test_bit_lookup() {
        let contract = load(base_contract()).unwrap();
        assert_eq!(contract.bit_value("yes_no", " y "), Some(1));
        assert_eq!(contract.bit_value("yes_no", "N"), Some(0));
        assert_eq!(contract.bit_value("yes_no", "maybe"), None);
    }

    #[test]
    fn test_child_without_relationship_is_rejected() {
        let mut value = base_contract();
        value["relationships"] = json!([]);
        let err = load(value).unwrap_err();
        assert!(err.to_string().contains("contact_base has no relationship"));
    }

    #[test]
    fn test_unknown_enum_is_rejected() {
        let mut value = base_contract();
        value["column_rules"][1]["transforms"][0]["enum_type"] = json!("nope");
        let err = load(value).unwrap_err();
        assert!(err.to_string().contains("unknown enum table nope"));
    }

    #[test]
    fn test_filter_rule_requires_discriminator() {
        let mut value = base_contract();
        value["element_filter_rules"][0]["discriminator"] = json!(" ");
        assert!(matches!(load(value), Err(ContractError::Invalid(_))));
    }

    #[test]
    fn test_parent_must_precede_child() {
        let mut value = base_contract();
        value["table_insertion_order"] = json!(["contact_base", "app_base"]);
        assert!(matches!(load(value), Err(ContractError::Invalid(_))));
    }

    #[test]
    fn test_bad_expression_is_rejected() {
        let mut value = base_contract();
        value["column_rules"]
            .as_array_mut()
            .unwrap()
            .push(json!({
                "table": "app_base",
                "column": "calc",
                "transforms": [{ "op": "calculated", "expression": "1 +" }]
            }));
        assert!(matches!(load(value), Err(ContractError::Expression { .. })));
    }

    #[test]
    fn test_duplicate_column_rule_is_rejected() {
        let mut value = base_contract();
        value["column_rules"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "table": "app_base", "column": "app_ident" }));
        let err = load(value).unwrap_err();
        assert!(err.to_string().contains("duplicate column rule"));
    }

    #[test]
    fn test_oversized_coerce_scale_is_rejected() {
        let mut value = base_contract();
        value["column_rules"]
            .as_array_mut()
            .unwrap()
            .push(json!({
                "table": "app_base",
                "column": "income",
                "transforms": [{ "op": "coerce", "to": "decimal", "scale": 999999999 }]
            }));
        let err = load(value).unwrap_err();
        assert!(err.to_string().contains("coerce scale"));
    }

    #[test]
    fn test_rule_on_foreign_key_is_rejected() {
        let mut value = base_contract();
        value["column_rules"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "table": "contact_base", "column": "app_id" }));
        assert!(matches!(load(value), Err(ContractError::Invalid(_))));
    }

    #[test]
    fn test_identifiers_are_checked() {
        let mut value = base_contract();
        value["target_schema"] = json!("dbo; drop table x");
        assert!(matches!(load(value), Err(ContractError::Invalid(_))));
        assert!(is_identifier("app_base_2"));
        assert!(!is_identifier("2app"));
    }

    #[test]
    fn test_malformed_json_is_syntax_error() {
        assert!(matches!(
            Contract::from_json("{ not json"),
            Err(ContractError::Syntax(_))
        ));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Contract::load("/nonexistent/contract.json").unwrap_err();
        assert!(matches!(err, ContractError::Read { .. }));
    }

    #[test]
    fn test_summary_counts() {
        let summary = load(base_contract()).unwrap().summary();
        assert_eq!(summary.root_table, "app_base");
        assert_eq!(summary.column_rules_per_table["app_base"], 1);
        assert_eq!(summary.enum_tables, 3);
        assert_eq!(summary.calculated_columns, 0);
    }
}
