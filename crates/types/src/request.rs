use serde::{Deserialize, Deserializer, Serialize};

/// Raw registration input as received at the service boundary.
///
/// Fields the validator requires are optional here so that a missing value
/// is reported as a validation failure rather than a decode error. The
/// camelCase aliases accept the field names used by existing clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default, alias = "domainId", deserialize_with = "domain_id_from_number_or_text")]
    pub domain_id: Option<i64>,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    pub username: Option<String>,
    #[serde(alias = "keyHandle")]
    pub key_handle: Option<String>,
    #[serde(alias = "publicKey")]
    pub public_key: Option<String>,
    #[serde(default, alias = "appId")]
    pub app_id: Option<String>,
    #[serde(default)]
    pub transports: Option<u16>,
    #[serde(default)]
    pub attestation: Option<AttestationInput>,
    #[serde(default)]
    pub counter: u32,
    #[serde(alias = "fidoVersion")]
    pub fido_version: Option<String>,
    #[serde(alias = "fidoProtocol")]
    pub fido_protocol: Option<String>,
    #[serde(default)]
    pub aaguid: Option<String>,
    #[serde(default, alias = "registrationSettings")]
    pub registration_settings: Option<String>,
    #[serde(default, alias = "registrationSettingsVersion")]
    pub registration_settings_version: Option<i32>,
    #[serde(alias = "createLocation")]
    pub create_location: Option<String>,
}

/// Attestation certificate reference as supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationInput {
    #[serde(alias = "serverId")]
    pub server_id: u16,
    #[serde(alias = "domainId")]
    pub domain_id: u64,
    #[serde(alias = "certificateId", alias = "certId")]
    pub certificate_id: u64,
}

/// Raw activation/deactivation input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    #[serde(default, alias = "domainId", deserialize_with = "domain_id_from_number_or_text")]
    pub domain_id: Option<i64>,
    pub protocol: Option<String>,
    pub username: Option<String>,
    pub handle: Option<String>,
    #[serde(default, alias = "modifyLocation")]
    pub modify_location: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

/// Domain ids arrive as JSON numbers or as decimal strings (`"1"`).
fn domain_id_from_number_or_text<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(id)) => Ok(Some(id)),
        Some(NumberOrText::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("domainId `{text}` is not an integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn domain_id_accepts_numbers_and_decimal_text() {
        let request: TransitionRequest = serde_json::from_value(json!({
            "domainId": "1",
            "protocol": "2.0",
            "username": "alice",
            "handle": "5-1-alice-7",
            "modifyLocation": "US"
        }))
        .unwrap();
        assert_eq!(request.domain_id, Some(1));
        assert_eq!(request.modify_location.as_deref(), Some("US"));

        let request: RegistrationRequest =
            serde_json::from_value(json!({ "domain_id": 2 })).unwrap();
        assert_eq!(request.domain_id, Some(2));

        let request: RegistrationRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request.domain_id, None);
        let request: TransitionRequest =
            serde_json::from_value(json!({ "domainId": null })).unwrap();
        assert_eq!(request.domain_id, None);

        let err = serde_json::from_value::<TransitionRequest>(json!({ "domainId": "one" }))
            .unwrap_err();
        assert!(err.to_string().contains("not an integer"));
    }

    #[test]
    fn attestation_accepts_short_certificate_field() {
        let attestation: AttestationInput = serde_json::from_value(json!({
            "serverId": 5,
            "domainId": 1,
            "certId": 42
        }))
        .unwrap();
        assert_eq!(attestation.certificate_id, 42);
    }
}
