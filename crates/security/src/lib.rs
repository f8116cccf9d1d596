//! Input validation for the credential lifecycle.
//!
//! [`InputValidator`] evaluates ordered, declarative rules and reports the
//! first violation. [`rules`] holds the rule sets for registration and for
//! activation/deactivation requests.

pub mod rules;
pub mod validation;

pub use rules::{registration_rules, transition_rules, FieldLimits};
pub use validation::{Constraint, InputValidator, ValidationError, ValidationIssue, ValidationRule};

use fidoreg_types::{RegistrationRequest, TransitionRequest};

/// Validate a registration request against [`registration_rules`].
pub fn validate_registration(
    request: &RegistrationRequest,
    limits: &FieldLimits,
) -> Result<(), ValidationError> {
    let result = InputValidator::new().validate(request, &registration_rules(limits));
    if let Err(err) = &result {
        tracing::warn!(field = err.field(), "registration rejected: {err}");
    }
    result
}

/// Validate an activation/deactivation request against [`transition_rules`].
pub fn validate_transition(
    request: &TransitionRequest,
    limits: &FieldLimits,
) -> Result<(), ValidationError> {
    let result = InputValidator::new().validate(request, &transition_rules(limits));
    if let Err(err) = &result {
        tracing::warn!(field = err.field(), "status change rejected: {err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> RegistrationRequest {
        RegistrationRequest {
            domain_id: Some(1),
            username: Some("alice".into()),
            key_handle: Some("KH1".into()),
            public_key: Some("PK1".into()),
            fido_version: Some("2.0".into()),
            fido_protocol: Some("2.0".into()),
            create_location: Some("US".into()),
            ..Default::default()
        }
    }

    fn transition() -> TransitionRequest {
        TransitionRequest {
            domain_id: Some(1),
            protocol: Some("2.0".into()),
            username: Some("alice".into()),
            handle: Some("5-1-alice-7".into()),
            modify_location: Some("US".into()),
        }
    }

    fn code(err: ValidationError) -> (String, String) {
        let issue = err.issue().cloned().unwrap();
        (issue.field, issue.code)
    }

    #[test]
    fn accepts_minimal_registration() {
        assert!(validate_registration(&registration(), &FieldLimits::default()).is_ok());
    }

    #[test]
    fn rejects_non_positive_domain_first() {
        let mut req = registration();
        req.domain_id = Some(0);
        req.username = None;
        let err = validate_registration(&req, &FieldLimits::default()).unwrap_err();
        assert_eq!(code(err), ("domain_id".into(), "min_value".into()));
    }

    #[test]
    fn rejects_blank_and_oversized_strings() {
        let limits = FieldLimits {
            short_string: 5,
            long_string: 8,
        };
        let mut req = registration();
        req.username = Some("   ".into());
        let err = validate_registration(&req, &limits).unwrap_err();
        assert_eq!(code(err), ("username".into(), "blank".into()));

        let mut req = registration();
        req.public_key = Some("x".repeat(9));
        let err = validate_registration(&req, &limits).unwrap_err();
        assert_eq!(code(err), ("public_key".into(), "max_length".into()));

        let mut req = registration();
        req.create_location = Some("Europe".into());
        let err = validate_registration(&req, &limits).unwrap_err();
        assert_eq!(code(err), ("create_location".into(), "max_length".into()));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut req = registration();
        req.fido_version = Some("U2F".into());
        let err = validate_registration(&req, &FieldLimits::default()).unwrap_err();
        assert_eq!(code(err), ("fido_version".into(), "unsupported".into()));
    }

    #[test]
    fn legacy_protocol_is_rejected_explicitly() {
        let mut req = registration();
        req.fido_protocol = Some(" uaf ".into());
        let err = validate_registration(&req, &FieldLimits::default()).unwrap_err();
        assert_eq!(code(err), ("fido_protocol".into(), "forbidden".into()));

        let mut req = transition();
        req.protocol = Some("UAF".into());
        let err = validate_transition(&req, &FieldLimits::default()).unwrap_err();
        assert_eq!(code(err), ("protocol".into(), "forbidden".into()));
    }

    #[test]
    fn transition_protocol_uses_version_literals() {
        assert!(validate_transition(&transition(), &FieldLimits::default()).is_ok());

        let mut req = transition();
        req.protocol = Some("U2F_V2".into());
        assert!(validate_transition(&req, &FieldLimits::default()).is_ok());

        req.protocol = Some("U2F".into());
        let err = validate_transition(&req, &FieldLimits::default()).unwrap_err();
        assert_eq!(code(err), ("protocol".into(), "unsupported".into()));
    }

    #[test]
    fn transition_requires_handle() {
        let mut req = transition();
        req.handle = Some(String::new());
        let err = validate_transition(&req, &FieldLimits::default()).unwrap_err();
        assert_eq!(code(err), ("handle".into(), "blank".into()));
    }
}
