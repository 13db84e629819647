//! Element selection and validation
//!
//! Selection runs before any transformation. It locates the root element and
//! identifier, walks every contract relationship to find the scope instances
//! each target table is built from, classifies repeated sub-elements against
//! their filter rule and resolves the contract's key identifiers.
//!
//! Severity is two-tier: a rejected element under a `critical` rule abandons
//! the whole document, one under a `skippable` rule is dropped and recorded.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::contract::{Contract, ElementFilterRule, Severity};
use crate::document::{Document, Element};
use crate::error::SelectionError;

/// An element some target row is built from
#[derive(Debug, Clone)]
pub struct ScopeInstance<'d> {
    pub id: usize,
    pub table: String,
    pub element: &'d Element,
    pub parent: Option<usize>,
    pub element_type: Option<String>,
    pub discriminator: Option<String>,
}

/// A sub-element dropped under a skippable rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedElement {
    pub table: String,
    pub element_type: String,
    pub reason: String,
}

/// A resolved key identifier and the element it came from
#[derive(Debug, Clone)]
pub struct KeyIdentifierMatch<'d> {
    pub value: String,
    pub discriminator: Option<String>,
    pub element: &'d Element,
}

#[derive(Debug, Clone)]
pub struct SelectionResult<'d> {
    pub document_id: i64,
    /// Element at the contract's root path
    pub root: &'d Element,
    pub instances: Vec<ScopeInstance<'d>>,
    pub key_identifiers: BTreeMap<String, KeyIdentifierMatch<'d>>,
    pub skipped: Vec<SkippedElement>,
}

impl<'d> SelectionResult<'d> {
    pub fn instances_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ScopeInstance<'d>> {
        self.instances.iter().filter(move |i| i.table == table)
    }

    pub fn key_identifier(&self, name: &str) -> Option<&KeyIdentifierMatch<'d>> {
        self.key_identifiers.get(name)
    }

    /// Valid elements of one type, in the order they were selected, each once
    pub fn group(&self, element_type: &str) -> Vec<&ScopeInstance<'d>> {
        let mut seen: Vec<*const Element> = Vec::new();
        self.instances
            .iter()
            .filter(|i| i.element_type.as_deref() == Some(element_type))
            .filter(|i| {
                let ptr: *const Element = i.element;
                if seen.contains(&ptr) {
                    false
                } else {
                    seen.push(ptr);
                    true
                }
            })
            .collect()
    }
}

enum Verdict {
    Valid {
        discriminator: String,
    },
    Rejected(String),
}

fn classify(element: &Element, rule: &ElementFilterRule) -> Verdict {
    let Some(discriminator) = element.attr(&rule.discriminator) else {
        return Verdict::Rejected(format!("missing discriminator {}", rule.discriminator));
    };
    if !rule.accepts(discriminator) {
        return Verdict::Rejected(format!(
            "unmapped {} value '{discriminator}'",
            rule.discriminator
        ));
    }
    if let Some(identity) = &rule.identity_attribute {
        if element.attr(identity).is_none() {
            return Verdict::Rejected(format!("missing identity attribute {identity}"));
        }
    }
    Verdict::Valid {
        discriminator: discriminator.to_string(),
    }
}

/// Select the scope instances of `document`.
///
/// `staged_id` is the identifier the document was staged under; when given,
/// the root identifier inside the payload must match it.
pub fn select<'d>(
    document: &'d Document,
    contract: &Contract,
    staged_id: Option<i64>,
) -> Result<SelectionResult<'d>, SelectionError> {
    let root_rule = contract.root();
    let root = document
        .select_absolute(&root_rule.element_path)
        .into_iter()
        .next()
        .ok_or_else(|| SelectionError::MissingRootElement(root_rule.element_path.to_string()))?;

    let raw_id = root
        .attr(&root_rule.identifier_attribute)
        .ok_or(SelectionError::MissingRootIdentifier)?;
    let document_id: i64 = raw_id
        .parse()
        .map_err(|_| SelectionError::InvalidRootIdentifier(raw_id.to_string()))?;
    if let Some(staged) = staged_id {
        if staged != document_id {
            return Err(SelectionError::RootIdentifierMismatch {
                staged,
                found: document_id,
            });
        }
    }

    let mut instances = vec![ScopeInstance {
        id: 0,
        table: root_rule.table.clone(),
        element: root,
        parent: None,
        element_type: None,
        discriminator: None,
    }];
    let mut skipped = Vec::new();

    for table in contract.insertion_order().iter().skip(1) {
        let Some(relationship) = contract.relationship_for(table) else {
            continue;
        };
        let parents: Vec<(usize, &'d Element, Option<String>)> = instances
            .iter()
            .filter(|i| i.table == relationship.parent_table)
            .map(|i| (i.id, i.element, i.discriminator.clone()))
            .collect();

        for (parent_id, parent_element, parent_discriminator) in parents {
            let candidates = match &relationship.source_path {
                Some(path) => document.resolve(parent_element, path),
                None => vec![parent_element],
            };

            let rule = relationship
                .element_type
                .as_deref()
                .and_then(|t| contract.filter_rule_for(t));
            let mut identities: HashSet<&str> = HashSet::new();

            for candidate in candidates {
                let discriminator = match rule {
                    None => {
                        // 1:1 extensions of the parent element keep its role
                        if relationship.source_path.is_none() {
                            parent_discriminator.clone()
                        } else {
                            None
                        }
                    }
                    Some(rule) => match classify(candidate, rule) {
                        Verdict::Valid { discriminator } => {
                            let identity = rule
                                .identity_attribute
                                .as_deref()
                                .and_then(|a| candidate.attr(a));
                            if let Some(identity) = identity {
                                if !identities.insert(identity) {
                                    debug!(
                                        document_id,
                                        table = %table,
                                        identity,
                                        "Dropping duplicate element"
                                    );
                                    skipped.push(SkippedElement {
                                        table: table.clone(),
                                        element_type: rule.element_type.clone(),
                                        reason: format!("duplicate identity '{identity}'"),
                                    });
                                    continue;
                                }
                            }
                            Some(discriminator)
                        }
                        Verdict::Rejected(reason) => match rule.severity {
                            Severity::Critical => {
                                return Err(SelectionError::CriticalElement {
                                    element_type: rule.element_type.clone(),
                                    reason,
                                })
                            }
                            Severity::Skippable => {
                                debug!(
                                    document_id,
                                    table = %table,
                                    reason = %reason,
                                    "Skipping invalid element"
                                );
                                skipped.push(SkippedElement {
                                    table: table.clone(),
                                    element_type: rule.element_type.clone(),
                                    reason,
                                });
                                continue;
                            }
                        },
                    },
                };

                let id = instances.len();
                instances.push(ScopeInstance {
                    id,
                    table: table.clone(),
                    element: candidate,
                    parent: Some(parent_id),
                    element_type: relationship.element_type.clone(),
                    discriminator,
                });
            }
        }
    }

    let mut selection = SelectionResult {
        document_id,
        root,
        instances,
        key_identifiers: BTreeMap::new(),
        skipped,
    };

    for key in contract.key_identifiers() {
        let group = selection.group(&key.element_type);
        let found = if key.discriminator_values.is_empty() {
            group.iter().find_map(|i| {
                i.element.attr(&key.attribute).map(|v| KeyIdentifierMatch {
                    value: v.to_string(),
                    discriminator: i.discriminator.clone(),
                    element: i.element,
                })
            })
        } else {
            key.discriminator_values.iter().find_map(|wanted| {
                group
                    .iter()
                    .filter(|i| i.discriminator.as_deref() == Some(wanted.as_str()))
                    .find_map(|i| {
                        i.element.attr(&key.attribute).map(|v| KeyIdentifierMatch {
                            value: v.to_string(),
                            discriminator: i.discriminator.clone(),
                            element: i.element,
                        })
                    })
            })
        };

        match found {
            Some(m) => {
                selection.key_identifiers.insert(key.name.clone(), m);
            }
            None if key.required => {
                return Err(SelectionError::MissingKeyIdentifier(key.name.clone()));
            }
            None => {}
        }
    }

    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract(severity: &str) -> Contract {
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
                    { "name": "contact_base", "key_column": "con_id" }
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
                    {
                        "element_type": "contact",
                        "discriminator": "ac_role_tp_c",
                        "valid_values": ["PR", "AUTHU"],
                        "identity_attribute": "con_id",
                        "severity": severity
                    },
                    {
                        "element_type": "address",
                        "discriminator": "address_tp_c",
                        "valid_values": ["CURR", "PREV"]
                    }
                ],
                "key_identifiers": [
                    {
                        "name": "primary_contact",
                        "element_type": "contact",
                        "attribute": "con_id",
                        "discriminator_values": ["PR"],
                        "required": true
                    },
                    {
                        "name": "secondary_contact",
                        "element_type": "contact",
                        "attribute": "con_id",
                        "discriminator_values": ["AUTHU"]
                    }
                ],
                "column_rules": []
            })
            .to_string(),
        )
        .unwrap()
    }

    fn doc(body: &str) -> Document {
        Document::parse(&format!(
            r#"<Provenir><Request ID="1001"><CustData>{body}</CustData></Request></Provenir>"#
        ))
        .unwrap()
    }

    #[test]
    fn test_selects_valid_contacts_and_skips_invalid() {
        let contract = contract("skippable");
        let document = doc(
            r#"<contact con_id="7" ac_role_tp_c="PR"><address address_tp_c="CURR"/><address/></contact>
               <contact con_id="8"/>"#,
        );
        let selection = select(&document, &contract, Some(1001)).unwrap();

        assert_eq!(selection.document_id, 1001);
        assert_eq!(selection.instances_of("contact_base").count(), 1);
        assert_eq!(selection.instances_of("contact_address").count(), 1);
        assert_eq!(selection.skipped.len(), 2);
        assert_eq!(
            selection.key_identifier("primary_contact").map(|k| k.value.as_str()),
            Some("7")
        );
        assert!(selection.key_identifier("secondary_contact").is_none());
    }

    #[test]
    fn test_critical_rule_abandons_document() {
        let contract = contract("critical");
        let document = doc(r#"<contact con_id="7" ac_role_tp_c="PR"/><contact con_id="8"/>"#);
        let err = select(&document, &contract, None).unwrap_err();
        assert!(matches!(err, SelectionError::CriticalElement { .. }));
    }

    #[test]
    fn test_missing_root_identifier() {
        let contract = contract("skippable");
        let document =
            Document::parse(r#"<Provenir><Request><CustData/></Request></Provenir>"#).unwrap();
        let err = select(&document, &contract, None).unwrap_err();
        assert_eq!(err, SelectionError::MissingRootIdentifier);
        assert_eq!(err.to_string(), "missing root identifier");

        let blank = Document::parse(r#"<Provenir><Request ID="  "/></Provenir>"#).unwrap();
        assert_eq!(
            select(&blank, &contract, None).unwrap_err(),
            SelectionError::MissingRootIdentifier
        );
    }

    #[test]
    fn test_non_integer_and_mismatched_identifier() {
        let contract = contract("skippable");
        let bad = Document::parse(r#"<Provenir><Request ID="abc"/></Provenir>"#).unwrap();
        assert!(matches!(
            select(&bad, &contract, None),
            Err(SelectionError::InvalidRootIdentifier(_))
        ));

        let document = doc(r#"<contact con_id="7" ac_role_tp_c="PR"/>"#);
        assert_eq!(
            select(&document, &contract, Some(1002)).unwrap_err(),
            SelectionError::RootIdentifierMismatch {
                staged: 1002,
                found: 1001
            }
        );
    }

    #[test]
    fn test_missing_root_element() {
        let contract = contract("skippable");
        let document = Document::parse(r#"<Other ID="1001"/>"#).unwrap();
        assert!(matches!(
            select(&document, &contract, None),
            Err(SelectionError::MissingRootElement(_))
        ));
    }

    #[test]
    fn test_required_key_identifier_missing_is_critical() {
        let contract = contract("skippable");
        let document = doc(r#"<contact con_id="9" ac_role_tp_c="AUTHU"/>"#);
        assert_eq!(
            select(&document, &contract, None).unwrap_err(),
            SelectionError::MissingKeyIdentifier("primary_contact".to_string())
        );
    }

    #[test]
    fn test_duplicate_identity_is_skipped() {
        let contract = contract("skippable");
        let document = doc(
            r#"<contact con_id="7" ac_role_tp_c="PR"/><contact con_id="7" ac_role_tp_c="AUTHU"/>"#,
        );
        let selection = select(&document, &contract, None).unwrap();
        assert_eq!(selection.instances_of("contact_base").count(), 1);
        assert_eq!(selection.skipped[0].reason, "duplicate identity '7'");
    }

    #[test]
    fn test_key_identifier_first_match_in_discriminator_order() {
        let contract = contract("skippable");
        let document = doc(
            r#"<contact con_id="20" ac_role_tp_c="AUTHU"/>
               <contact con_id="10" ac_role_tp_c="PR"/>
               <contact con_id="11" ac_role_tp_c="PR"/>"#,
        );
        let selection = select(&document, &contract, None).unwrap();
        assert_eq!(
            selection.key_identifier("primary_contact").map(|k| k.value.as_str()),
            Some("10")
        );
        assert_eq!(
            selection.key_identifier("secondary_contact").map(|k| k.value.as_str()),
            Some("20")
        );
    }
}
