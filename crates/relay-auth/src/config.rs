use serde::{Deserialize, Serialize};

/// Token signing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret shared by issue and validate.
    pub secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub issuer: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_ttl_secs: 3600,
            refresh_ttl_secs: 21600,
            issuer: "relay".into(),
        }
    }
}
