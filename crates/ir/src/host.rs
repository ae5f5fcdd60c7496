//! Hosts: virtual-host identities, optionally with TLS material attached.

use serde::Serialize;

use tiller_core::NormalizedResource;

#[derive(Debug, Clone, Serialize)]
pub struct IrHost {
    pub name: String,
    pub namespace: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
    /// Whether the named secret actually resolved to TLS material.
    pub tls_active: bool,
}

impl IrHost {
    pub fn from_resource(resource: &NormalizedResource) -> Result<Self, String> {
        let hostname = resource
            .get_str("hostname")
            .ok_or_else(|| format!("Host {} has a non-string hostname", resource.rkey))?;

        let tls_secret = resource
            .get("tls_secret")
            .and_then(|v| match v {
                // Accept both the bare name and the {"name": ...} form.
                serde_json::Value::String(s) => Some(s.clone()),
                other => other.get("name").and_then(serde_json::Value::as_str).map(str::to_string),
            });

        Ok(Self {
            name: resource.name().to_string(),
            namespace: resource.namespace().to_string(),
            hostname: hostname.to_string(),
            tls_secret,
            tls_active: false,
        })
    }
}
