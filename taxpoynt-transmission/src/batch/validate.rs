use std::collections::HashSet;

use serde_json::Value;

use super::{BatchRequest, ValidationReport};

fn is_empty(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(values) => values.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Check a batch's structure before anything is sent.
///
/// Every problem is reported, in item order. Duplicate document ids are
/// reported once per id.
#[must_use]
pub fn validate_batch(request: &BatchRequest) -> ValidationReport {
    let mut errors = Vec::new();

    if request.items.is_empty() {
        errors.push("Empty batch".to_string());
    }

    let mut seen = HashSet::new();
    let mut duplicates = HashSet::new();

    for item in &request.items {
        if item.document_id.trim().is_empty() {
            errors.push(format!("Missing document_id: {}", item.item_id));
        } else if !seen.insert(item.document_id.as_str())
            && duplicates.insert(item.document_id.as_str())
        {
            errors.push(format!("Duplicate document ID: {}", item.document_id));
        }

        if item.document_type.trim().is_empty() {
            errors.push(format!("Missing document_type: {}", item.item_id));
        }

        if is_empty(&item.document_data) {
            errors.push(format!("Empty document data: {}", item.item_id));
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}
