use serde::{Deserialize, Serialize};
use stackable_operator::schemars::{self, JsonSchema};

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlauthTls {
    /// Whether clients may upgrade a plaintext connection on the LDAP port
    /// to TLS in-band (StartTLS). Enabled by default.
    #[serde(default = "GlauthTls::default_starttls_enabled")]
    pub starttls_enabled: bool,

    /// Whether to additionally serve LDAP over TLS on a dedicated LDAPS port.
    /// Disabled by default.
    #[serde(default)]
    pub ldaps_enabled: bool,
}

impl Default for GlauthTls {
    fn default() -> Self {
        Self {
            starttls_enabled: Self::default_starttls_enabled(),
            ldaps_enabled: false,
        }
    }
}

impl GlauthTls {
    const fn default_starttls_enabled() -> bool {
        true
    }

    /// Whether any listener needs server key material.
    pub fn tls_enabled(&self) -> bool {
        self.starttls_enabled || self.ldaps_enabled
    }
}
