use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Rule-driven validator for incoming requests.
///
/// Converts a serializable payload into a `serde_json::Value` and walks the
/// rules in order. Evaluation stops at the first violated constraint, so the
/// order of the rule list is part of the contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a payload against an ordered list of rules, returning the
    /// first violation.
    pub fn validate<T>(&self, data: &T, rules: &[ValidationRule]) -> Result<(), ValidationError>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(data)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?;

        for rule in rules {
            let field_value = lookup_field(&value, &rule.field);
            for constraint in &rule.constraints {
                if let Some(issue) = check_constraint(rule, field_value, constraint) {
                    return Err(ValidationError::Rejected(issue));
                }
            }
        }

        Ok(())
    }
}

fn check_constraint(
    rule: &ValidationRule,
    value: Option<&Value>,
    constraint: &Constraint,
) -> Option<ValidationIssue> {
    let label = rule.label();
    let present = value.filter(|v| !v.is_null());

    match constraint {
        Constraint::Required { message } => {
            if present.is_none() {
                return Some(ValidationIssue::new(
                    &rule.field,
                    "required",
                    message,
                    format!("missing required field {label}"),
                ));
            }
        }
        Constraint::NonBlank { message } => {
            if present.map(is_blank).unwrap_or(true) {
                return Some(ValidationIssue::new(
                    &rule.field,
                    "blank",
                    message,
                    format!("{label} must not be blank"),
                ));
            }
        }
        Constraint::MaxLength { max, message } => {
            if let Some(len) = present.and_then(extract_length) {
                if len > *max {
                    return Some(ValidationIssue::new(
                        &rule.field,
                        "max_length",
                        message,
                        format!("{label} exceeds {max} characters"),
                    ));
                }
            }
        }
        Constraint::MinValue { min, message } => match present.map(extract_number) {
            Some(Some(num)) if num >= *min => {}
            Some(_) => {
                return Some(ValidationIssue::new(
                    &rule.field,
                    "min_value",
                    message,
                    format!("{label} must be at least {min}"),
                ));
            }
            None => {}
        },
        Constraint::OneOf { values, message } => {
            if let Some(text) = present.and_then(Value::as_str) {
                let text = text.trim();
                if !values.iter().any(|c| c.eq_ignore_ascii_case(text)) {
                    return Some(ValidationIssue::new(
                        &rule.field,
                        "unsupported",
                        message,
                        format!("{label} must be one of {values:?}"),
                    ));
                }
            }
        }
        Constraint::NoneOf { values, message } => {
            if let Some(text) = present.and_then(Value::as_str) {
                let text = text.trim();
                if values.iter().any(|c| c.eq_ignore_ascii_case(text)) {
                    return Some(ValidationIssue::new(
                        &rule.field,
                        "forbidden",
                        message,
                        format!("{label} value {text} is not accepted"),
                    ));
                }
            }
        }
    }

    None
}

/// Declarative rule describing the constraints for one field.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub field: String,
    pub display_name: Option<String>,
    pub constraints: Vec<Constraint>,
}

impl ValidationRule {
    /// Create a new rule for a given field path.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            display_name: None,
            constraints: Vec::new(),
        }
    }

    /// Human readable name used in default messages.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn required(self) -> Self {
        self.with_constraint(Constraint::Required { message: None })
    }

    pub fn non_blank(self) -> Self {
        self.with_constraint(Constraint::NonBlank { message: None })
    }

    pub fn max_length(self, max: usize) -> Self {
        self.with_constraint(Constraint::MaxLength { max, message: None })
    }

    pub fn min_value(self, min: f64) -> Self {
        self.with_constraint(Constraint::MinValue { min, message: None })
    }

    pub fn one_of<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_constraint(Constraint::OneOf {
            values: values.into_iter().map(Into::into).collect(),
            message: None,
        })
    }

    pub fn none_of<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_constraint(Constraint::NoneOf {
            values: values.into_iter().map(Into::into).collect(),
            message: None,
        })
    }

    fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.field)
    }
}

/// Supported constraint types. String comparisons trim the input and
/// ignore ASCII case.
#[derive(Debug, Clone)]
pub enum Constraint {
    Required { message: Option<String> },
    NonBlank { message: Option<String> },
    MaxLength { max: usize, message: Option<String> },
    MinValue { min: f64, message: Option<String> },
    OneOf { values: Vec<String>, message: Option<String> },
    NoneOf { values: Vec<String>, message: Option<String> },
}

impl Constraint {
    pub fn with_message(self, message: impl Into<String>) -> Self {
        let message = Some(message.into());
        match self {
            Constraint::Required { .. } => Constraint::Required { message },
            Constraint::NonBlank { .. } => Constraint::NonBlank { message },
            Constraint::MaxLength { max, .. } => Constraint::MaxLength { max, message },
            Constraint::MinValue { min, .. } => Constraint::MinValue { min, message },
            Constraint::OneOf { values, .. } => Constraint::OneOf { values, message },
            Constraint::NoneOf { values, .. } => Constraint::NoneOf { values, message },
        }
    }
}

/// Error returned for the first violated constraint.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Rejected(ValidationIssue),
    #[error("failed to serialize input for validation: {0}")]
    Serialization(String),
}

impl ValidationError {
    pub fn issue(&self) -> Option<&ValidationIssue> {
        match self {
            ValidationError::Rejected(issue) => Some(issue),
            ValidationError::Serialization(_) => None,
        }
    }

    pub fn field(&self) -> &str {
        self.issue().map(|i| i.field.as_str()).unwrap_or("request")
    }
}

/// Detailed information about a single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl ValidationIssue {
    fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        custom_message: &Option<String>,
        default: String,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: custom_message.clone().unwrap_or(default),
        }
    }
}

fn lookup_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(items) => {
                let idx = segment.parse::<usize>().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

fn extract_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.trim().chars().count()),
        Value::Array(arr) => Some(arr.len()),
        _ => None,
    }
}

fn extract_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(arr) => arr.is_empty(),
        _ => false,
    }
}
