//! Rule sets for the credential lifecycle operations.

use crate::validation::{Constraint, ValidationRule};
use fidoreg_types::{FidoProtocol, FidoVersion, LEGACY_PROTOCOL};
use serde::{Deserialize, Serialize};

/// Length bounds applied to free-form string inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLimits {
    /// Bound for names and locations.
    pub short_string: usize,
    /// Bound for key handles and public keys.
    pub long_string: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            short_string: 256,
            long_string: 512,
        }
    }
}

fn legacy_protocol() -> Constraint {
    Constraint::NoneOf {
        values: vec![LEGACY_PROTOCOL.to_string()],
        message: None,
    }
    .with_message(format!("{LEGACY_PROTOCOL} protocol is not supported"))
}

/// Ordered checks for a registration request.
pub fn registration_rules(limits: &FieldLimits) -> Vec<ValidationRule> {
    vec![
        ValidationRule::new("domain_id")
            .named("did")
            .required()
            .min_value(1.0),
        ValidationRule::new("username")
            .named("USERNAME")
            .required()
            .non_blank()
            .max_length(limits.short_string),
        ValidationRule::new("key_handle")
            .named("USER KEY HANDLE")
            .required()
            .non_blank()
            .max_length(limits.long_string),
        ValidationRule::new("public_key")
            .named("USER PUBLIC KEY")
            .required()
            .non_blank()
            .max_length(limits.long_string),
        ValidationRule::new("create_location")
            .named("CREATE LOCATION")
            .required()
            .non_blank()
            .max_length(limits.short_string),
        ValidationRule::new("fido_version")
            .named("FIDO VERSION")
            .required()
            .non_blank()
            .one_of(FidoVersion::ALL.iter().map(FidoVersion::as_str)),
        ValidationRule::new("fido_protocol")
            .named("FIDO PROTOCOL")
            .required()
            .non_blank()
            .with_constraint(legacy_protocol())
            .one_of(FidoProtocol::ALL.iter().map(FidoProtocol::as_str)),
    ]
}

/// Ordered checks for an activation or deactivation request.
///
/// Note the protocol field takes the version literals (`U2F_V2`, `2.0`).
pub fn transition_rules(limits: &FieldLimits) -> Vec<ValidationRule> {
    vec![
        ValidationRule::new("domain_id")
            .named("did")
            .required()
            .min_value(1.0),
        ValidationRule::new("username")
            .required()
            .non_blank()
            .max_length(limits.short_string),
        ValidationRule::new("handle")
            .named("randomid")
            .required()
            .non_blank(),
        ValidationRule::new("protocol")
            .required()
            .non_blank()
            .with_constraint(legacy_protocol())
            .one_of(FidoVersion::ALL.iter().map(FidoVersion::as_str)),
        ValidationRule::new("modify_location")
            .named("MODIFY LOCATION")
            .max_length(limits.short_string),
    ]
}
