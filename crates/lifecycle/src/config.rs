use fidoreg_security::FieldLimits;
use fidoreg_types::ServerId;
use serde::{Deserialize, Serialize};

/// Settings shared by the registrar and the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Identifier of this node, embedded in every credential it creates.
    pub server_id: ServerId,
    pub limits: FieldLimits,
    /// Keep the directory's keys-enabled flag in step with the user's
    /// active credentials.
    pub directory_sync: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            limits: FieldLimits::default(),
            directory_sync: false,
        }
    }
}
