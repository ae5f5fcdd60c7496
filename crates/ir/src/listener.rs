//! Listeners: the ports Envoy binds. When the config declares none, a
//! plain HTTP listener on 8080 is synthesized so an otherwise valid config
//! still serves.

use serde::Serialize;

use tiller_core::NormalizedResource;

pub const DEFAULT_HTTP_PORT: i64 = 8080;

#[derive(Debug, Clone, Serialize)]
pub struct IrListener {
    pub name: String,
    pub port: i64,
    pub protocol: String,
    /// Synthesized rather than declared by the config.
    pub synthesized: bool,
}

impl IrListener {
    pub fn from_resource(resource: &NormalizedResource) -> Result<Self, String> {
        let port = resource
            .get_i64("port")
            .ok_or_else(|| format!("Listener {} has a non-numeric port", resource.rkey))?;
        if !(1..=65535).contains(&port) {
            return Err(format!("Listener {} port {port} out of range", resource.rkey));
        }

        Ok(Self {
            name: resource.name().to_string(),
            port,
            protocol: resource.get_str("protocol").unwrap_or("HTTP").to_string(),
            synthesized: false,
        })
    }

    pub fn default_http() -> Self {
        Self {
            name: "default-http".to_string(),
            port: DEFAULT_HTTP_PORT,
            protocol: "HTTP".to_string(),
            synthesized: true,
        }
    }
}
