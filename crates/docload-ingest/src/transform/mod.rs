//! Transformation engine
//!
//! Turns a selected document into a [`RowSet`]: one sparse row per scope
//! instance, tables in insertion order, with foreign keys left as [`RowRef`]
//! placeholders for the persistence engine to resolve.
//!
//! For every column rule the engine extracts the raw source value and runs the
//! transform chain left to right. A `fallback` step only runs when the chain
//! has no value yet; an ordinary producer step (`field`, `copy`, `calculated`,
//! `literal`) always runs; an ordinary reshaping step (`coerce`, `enum`, `bit`)
//! only runs on a present value. If the chain ends without a value the rule's
//! default is used, otherwise the column is left out of the row.

mod steps;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::contract::{ColumnRule, Contract, ErrorPolicy};
use crate::document::Document;
use crate::error::TransformError;
use crate::selector::{ScopeInstance, SelectionResult, SkippedElement};
use crate::value::Value;

use steps::{apply, extract, StepContext};

/// Local placeholder id of a row inside one row-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RowRef(pub usize);

/// Foreign key to be filled with the parent row's stored key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentLink {
    pub row: RowRef,
    pub foreign_key_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRow {
    pub row_ref: RowRef,
    pub table: String,
    pub columns: BTreeMap<String, Value>,
    pub parent: Option<ParentLink>,
}

/// All rows produced from one document, in insertion order
#[derive(Debug, Clone, Serialize)]
pub struct RowSet {
    pub document_id: i64,
    pub rows: Vec<TargetRow>,
    pub report: TransformReport,
}

impl RowSet {
    pub fn rows_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a TargetRow> {
        self.rows.iter().filter(move |r| r.table == table)
    }

    pub fn row(&self, row_ref: RowRef) -> Option<&TargetRow> {
        self.rows.iter().find(|r| r.row_ref == row_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Coercion,
    OutOfRange,
    UnmappedEnum,
    UnknownToken,
    Expression,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Coercion => "coercion",
            IssueKind::OutOfRange => "out_of_range",
            IssueKind::UnmappedEnum => "unmapped_enum",
            IssueKind::UnknownToken => "unknown_token",
            IssueKind::Expression => "expression",
        }
    }
}

/// A column that could not be produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnIssue {
    pub table: String,
    pub column: String,
    pub kind: IssueKind,
    pub detail: String,
}

impl std::fmt::Display for ColumnIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}: {} ({})",
            self.table,
            self.column,
            self.detail,
            self.kind.as_str()
        )
    }
}

/// Non-fatal findings collected while building a row-set
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformReport {
    /// Issues on `omit` columns; the column was left out and processing continued
    pub issues: Vec<ColumnIssue>,
    pub skipped_elements: Vec<SkippedElement>,
    pub defaulted_columns: usize,
    /// Child scope instances that produced no columns
    pub empty_rows: usize,
}

/// Build the row-set for a selected document
pub fn transform(
    document: &Document,
    selection: &SelectionResult<'_>,
    contract: &Contract,
) -> Result<RowSet, TransformError> {
    let mut rows: Vec<TargetRow> = Vec::new();
    let mut report = TransformReport {
        skipped_elements: selection.skipped.clone(),
        ..TransformReport::default()
    };
    let mut row_for_instance: HashMap<usize, RowRef> = HashMap::new();
    let root_table = contract.root().table.as_str();

    for table in contract.insertion_order() {
        let relationship = contract.relationship_for(table);

        for instance in selection.instances_of(table) {
            let parent = match (relationship, instance.parent) {
                (Some(rel), Some(parent_id)) => match row_for_instance.get(&parent_id) {
                    Some(row) => Some(ParentLink {
                        row: *row,
                        foreign_key_column: rel.foreign_key_column.clone(),
                    }),
                    // Parent produced no row, so nothing can reference it
                    None => continue,
                },
                _ => None,
            };

            let columns = build_columns(contract, document, selection, instance, &mut report)?;
            if columns.is_empty() && table != root_table {
                report.empty_rows += 1;
                continue;
            }

            let row_ref = RowRef(rows.len());
            row_for_instance.insert(instance.id, row_ref);
            rows.push(TargetRow {
                row_ref,
                table: table.clone(),
                columns,
                parent,
            });
        }
    }

    debug!(
        document_id = selection.document_id,
        rows = rows.len(),
        issues = report.issues.len(),
        "Built row-set"
    );

    Ok(RowSet {
        document_id: selection.document_id,
        rows,
        report,
    })
}

fn build_columns(
    contract: &Contract,
    document: &Document,
    selection: &SelectionResult<'_>,
    instance: &ScopeInstance<'_>,
    report: &mut TransformReport,
) -> Result<BTreeMap<String, Value>, TransformError> {
    let mut columns = BTreeMap::new();

    for rule in contract.column_rules_for(&instance.table) {
        if let Some(value) = resolve_column(contract, document, selection, instance, rule, &columns, report)? {
            columns.insert(rule.column.clone(), value);
        }
    }

    Ok(columns)
}

fn resolve_column(
    contract: &Contract,
    document: &Document,
    selection: &SelectionResult<'_>,
    instance: &ScopeInstance<'_>,
    rule: &ColumnRule,
    row: &BTreeMap<String, Value>,
    report: &mut TransformReport,
) -> Result<Option<Value>, TransformError> {
    let mut current = rule
        .source
        .as_ref()
        .and_then(|source| extract(document, instance.element, source));

    for step in &rule.steps {
        let runs = if step.fallback {
            current.is_none()
        } else {
            current.is_some() || step.kind.is_producer()
        };
        if !runs {
            continue;
        }

        let outcome = {
            let ctx = StepContext {
                contract,
                document,
                selection,
                scope: instance.element,
                row,
                current: current.as_ref(),
            };
            apply(&step.kind, current.clone(), &ctx)
        };

        match outcome {
            Ok(value) => current = value.filter(|v| !v.is_blank()),
            Err((kind, detail)) => {
                let issue = ColumnIssue {
                    table: rule.table.clone(),
                    column: rule.column.clone(),
                    kind,
                    detail,
                };
                match rule.on_error {
                    ErrorPolicy::Abandon => return Err(TransformError::Column(issue)),
                    ErrorPolicy::Omit => {
                        debug!(
                            document_id = selection.document_id,
                            table = %rule.table,
                            column = %rule.column,
                            step = step.kind.name(),
                            issue = %issue,
                            "Omitting column"
                        );
                        report.issues.push(issue);
                        current = None;
                    }
                }
            }
        }
    }

    if current.is_none() {
        if let Some(default) = &rule.default {
            report.defaulted_columns += 1;
            current = Some(default.clone());
        }
    }

    if current.is_none() && !rule.nullable {
        return Err(TransformError::RequiredColumnMissing {
            table: rule.table.clone(),
            column: rule.column.clone(),
        });
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::select;
    use serde_json::json;

    fn contract(column_rules: serde_json::Value) -> Contract {
        Contract::from_json(
            &json!({
                "target_schema": "dbo",
                "root": {
                    "table": "app_base",
                    "element_path": "/Provenir/Request",
                    "identifier_attribute": "ID"
                },
                "table_insertion_order": ["app_base", "contact_base", "contact_address"],
                "tables": [
                    { "name": "app_base", "key_column": "app_id" },
                    { "name": "contact_base", "key_column": "con_id", "generated_key": true }
                ],
                "relationships": [
                    {
                        "parent_table": "app_base",
                        "child_table": "contact_base",
                        "foreign_key_column": "app_id",
                        "source_path": "CustData/contact",
                        "element_type": "contact"
                    },
                    {
                        "parent_table": "contact_base",
                        "child_table": "contact_address",
                        "foreign_key_column": "con_id",
                        "source_path": "address",
                        "element_type": "address"
                    }
                ],
                "element_filter_rules": [
                    { "element_type": "contact", "discriminator": "ac_role_tp_c", "valid_values": ["PR", "AUTHU"] },
                    { "element_type": "address", "discriminator": "address_tp_c" }
                ],
                "key_identifiers": [{
                    "name": "primary",
                    "element_type": "contact",
                    "attribute": "ssn",
                    "discriminator_values": ["PR"]
                }],
                "enum_tables": {
                    "contact_type": { "values": { "PR": 281, "AUTHU": 280 } },
                    "strict": { "values": { "A": 1 }, "required": true }
                },
                "bit_conversions": {
                    "yes_no": { "truthy": ["Y"], "falsy": ["N"] }
                },
                "column_rules": column_rules
            })
            .to_string(),
        )
        .unwrap()
    }

    const DOC: &str = r#"<Provenir><Request ID="1001" channel="WEB">
        <CustData>
            <application income="60000" monthly="" flag="Y" bad_number="n/a"/>
            <contact ac_role_tp_c="PR" ssn="111" first_name=" Jane " birth_date="1980-02-03">
                <address address_tp_c="CURR" city="Austin"/>
                <address address_tp_c="PREV"/>
            </contact>
            <contact ac_role_tp_c="AUTHU" ssn="222"/>
        </CustData>
    </Request></Provenir>"#;

    fn run(column_rules: serde_json::Value) -> Result<RowSet, TransformError> {
        let contract = contract(column_rules);
        let document = Document::parse(DOC).unwrap();
        let selection = select(&document, &contract, Some(1001)).unwrap();
        transform(&document, &selection, &contract)
    }

    #[test]
    fn test_rows_in_insertion_order_with_parent_links() {
        let row_set = run(json!([
            { "table": "app_base", "column": "app_id", "source": { "attribute": "ID" },
              "transforms": [{ "op": "coerce", "to": "int" }] },
            { "table": "contact_base", "column": "first_name", "source": { "attribute": "first_name" } },
            { "table": "contact_base", "column": "contact_type_enum", "source": { "attribute": "ac_role_tp_c" },
              "transforms": [{ "op": "enum", "enum_type": "contact_type" }] },
            { "table": "contact_address", "column": "city", "source": { "attribute": "city" } }
        ]))
        .unwrap();

        let tables: Vec<&str> = row_set.rows.iter().map(|r| r.table.as_str()).collect();
        assert_eq!(tables, vec!["app_base", "contact_base", "contact_base", "contact_address"]);

        let root = &row_set.rows[0];
        assert_eq!(root.columns["app_id"], Value::Int(1001));
        assert!(root.parent.is_none());

        let primary = &row_set.rows[1];
        assert_eq!(primary.columns["first_name"], Value::text("Jane"));
        assert_eq!(primary.columns["contact_type_enum"], Value::Int(281));
        assert_eq!(
            primary.parent,
            Some(ParentLink {
                row: RowRef(0),
                foreign_key_column: "app_id".to_string()
            })
        );

        // The PREV address has no city, so only one address row exists
        let address = &row_set.rows[3];
        assert_eq!(address.parent.as_ref().map(|p| p.row), Some(RowRef(1)));
        assert_eq!(row_set.report.empty_rows, 1);
    }

    #[test]
    fn test_absent_source_is_omitted_not_fabricated() {
        let row_set = run(json!([
            { "table": "app_base", "column": "monthly", "source": { "path": "CustData/application", "attribute": "monthly" } },
            { "table": "app_base", "column": "missing", "source": { "attribute": "nope" },
              "transforms": [{ "op": "coerce", "to": "int" }] }
        ]))
        .unwrap();
        assert!(row_set.rows[0].columns.is_empty());
    }

    #[test]
    fn test_fallback_chain_uses_calculated_value() {
        let row_set = run(json!([
            { "table": "app_base", "column": "monthly_income",
              "transforms": [
                  { "op": "field", "path": "CustData/application", "attribute": "monthly" },
                  { "op": "calculated", "expression": "'X'", "fallback": true }
              ] }
        ]))
        .unwrap();
        assert_eq!(row_set.rows[0].columns["monthly_income"], Value::text("X"));
    }

    #[test]
    fn test_fallback_skipped_when_value_present() {
        let row_set = run(json!([
            { "table": "app_base", "column": "income",
              "transforms": [
                  { "op": "field", "path": "CustData/application", "attribute": "income" },
                  { "op": "literal", "value": 0, "fallback": true },
                  { "op": "coerce", "to": "int" }
              ] }
        ]))
        .unwrap();
        assert_eq!(row_set.rows[0].columns["income"], Value::Int(60000));
    }

    #[test]
    fn test_default_applies_when_absent() {
        let row_set = run(json!([
            { "table": "app_base", "column": "region", "source": { "attribute": "region" }, "default": "US" }
        ]))
        .unwrap();
        assert_eq!(row_set.rows[0].columns["region"], Value::text("US"));
        assert_eq!(row_set.report.defaulted_columns, 1);
    }

    #[test]
    fn test_omit_policy_records_issue_and_continues() {
        let row_set = run(json!([
            { "table": "app_base", "column": "amount",
              "source": { "path": "CustData/application", "attribute": "bad_number" },
              "transforms": [{ "op": "coerce", "to": "decimal", "scale": 2 }] },
            { "table": "app_base", "column": "channel", "source": { "attribute": "channel" } }
        ]))
        .unwrap();
        assert!(!row_set.rows[0].columns.contains_key("amount"));
        assert_eq!(row_set.rows[0].columns["channel"], Value::text("WEB"));
        assert_eq!(row_set.report.issues.len(), 1);
        assert_eq!(row_set.report.issues[0].kind, IssueKind::Coercion);
    }

    #[test]
    fn test_abandon_policy_fails_document() {
        let err = run(json!([
            { "table": "app_base", "column": "amount",
              "source": { "path": "CustData/application", "attribute": "bad_number" },
              "transforms": [{ "op": "coerce", "to": "int" }],
              "on_error": "abandon" }
        ]))
        .unwrap_err();
        assert!(matches!(err, TransformError::Column(ref issue) if issue.column == "amount"));
    }

    #[test]
    fn test_required_enum_without_default_is_an_issue() {
        let row_set = run(json!([
            { "table": "app_base", "column": "strict_code", "source": { "attribute": "channel" },
              "transforms": [{ "op": "enum", "enum_type": "strict" }] }
        ]))
        .unwrap();
        assert_eq!(row_set.report.issues[0].kind, IssueKind::UnmappedEnum);
    }

    #[test]
    fn test_non_nullable_absent_column_abandons() {
        let err = run(json!([
            { "table": "app_base", "column": "must", "source": { "attribute": "nope" }, "nullable": false }
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            TransformError::RequiredColumnMissing {
                table: "app_base".to_string(),
                column: "must".to_string()
            }
        );
    }

    #[test]
    fn test_bit_copy_and_calculated_steps() {
        let row_set = run(json!([
            { "table": "app_base", "column": "flag_bit",
              "source": { "path": "CustData/application", "attribute": "flag" },
              "transforms": [{ "op": "bit", "conversion": "yes_no" }] },
            { "table": "app_base", "column": "primary_ssn",
              "transforms": [{ "op": "copy", "key_identifier": "primary" }] },
            { "table": "app_base", "column": "primary_birth",
              "transforms": [
                  { "op": "copy", "key_identifier": "primary", "attribute": "birth_date" },
                  { "op": "coerce", "to": "date" }
              ] },
            { "table": "contact_base", "column": "label",
              "transforms": [{ "op": "calculated",
                               "expression": "CASE WHEN ac_role_tp_c = 'PR' THEN UPPER(TRIM(first_name)) ELSE 'USER ' || ssn END" }] },
            { "table": "contact_base", "column": "income_monthly",
              "transforms": [
                  { "op": "calculated", "expression": "field('/Provenir/Request/CustData/application', 'income') / 12" },
                  { "op": "coerce", "to": "decimal", "scale": 2 }
              ] }
        ]))
        .unwrap();

        let root = &row_set.rows[0];
        assert_eq!(root.columns["flag_bit"], Value::Int(1));
        assert_eq!(root.columns["primary_ssn"], Value::text("111"));
        assert_eq!(
            root.columns["primary_birth"],
            Value::Date(chrono::NaiveDate::from_ymd_opt(1980, 2, 3).unwrap())
        );

        let contacts: Vec<&TargetRow> = row_set.rows_for("contact_base").collect();
        assert_eq!(contacts[0].columns["label"], Value::text("JANE"));
        assert_eq!(contacts[1].columns["label"], Value::text("USER 222"));
        assert_eq!(contacts[0].columns["income_monthly"].to_i64(), Some(5000));
    }

    #[test]
    fn test_calculated_reads_previously_resolved_columns() {
        let row_set = run(json!([
            { "table": "app_base", "column": "app_id", "source": { "attribute": "ID" },
              "transforms": [{ "op": "coerce", "to": "int" }] },
            { "table": "app_base", "column": "app_id_plus",
              "transforms": [{ "op": "calculated", "expression": "app_id + 1" }] }
        ]))
        .unwrap();
        assert_eq!(row_set.rows[0].columns["app_id_plus"], Value::Int(1002));
    }

    #[test]
    fn test_skipped_elements_are_reported() {
        let contract = contract(json!([]));
        let document = Document::parse(
            r#"<Provenir><Request ID="5"><CustData><contact ssn="1"/></CustData></Request></Provenir>"#,
        )
        .unwrap();
        let selection = select(&document, &contract, None).unwrap();
        let row_set = transform(&document, &selection, &contract).unwrap();
        assert_eq!(row_set.rows.len(), 1);
        assert_eq!(row_set.report.skipped_elements.len(), 1);
    }
}
