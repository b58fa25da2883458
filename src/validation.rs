use crate::models::NewDeal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Per-field validation failures, rendered inline next to each input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|entry| entry.field == name)
            .map(|entry| entry.message.as_str())
    }

    fn push(&mut self, field: &str, message: &str) {
        self.fields.push(FieldError {
            field: field.to_string(),
            message: message.to_string(),
        });
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .fields
            .iter()
            .map(|entry| format!("{}: {}", entry.field, entry.message))
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// A deal that passed validation. The name is already trimmed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidDeal {
    pub name: String,
    pub value: f64,
}

pub fn validate_deal(input: &NewDeal) -> Result<ValidDeal, ValidationErrors> {
    let mut errors = ValidationErrors::default();
    let name = input.name.trim();

    if name.is_empty() {
        errors.push("name", "Deal name is required");
    }
    if !input.value.is_finite() || input.value <= 0.0 {
        errors.push("value", "Deal value must be greater than zero");
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ValidDeal {
        name: name.to_string(),
        value: input.value,
    })
}

pub fn normalize_display_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
