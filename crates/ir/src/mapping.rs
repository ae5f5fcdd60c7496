//! Mappings and mapping groups: the per-route unit of the IR, and the
//! cacheable unit of incremental rebuilds.

use std::hash::{Hash, Hasher};

use regex::Regex;
use rustc_hash::FxHasher;
use serde::Serialize;

use tiller_core::NormalizedResource;

use crate::IrDefaults;

/// One route: a Mapping resource compiled into its IR form.
#[derive(Debug, Clone, Serialize)]
pub struct IrMapping {
    pub name: String,
    pub namespace: String,
    pub prefix: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub precedence: i64,
    pub prefix_regex: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_redirect: Option<String>,
    pub cluster_name: String,
    pub group_id: String,
    #[serde(rename = "_cache_key", skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

impl IrMapping {
    /// Compile one validated Mapping resource. The shape check already
    /// guarantees prefix and service exist; everything deeper is checked
    /// here.
    pub fn from_resource(
        resource: &NormalizedResource,
        defaults: &IrDefaults,
    ) -> Result<Self, String> {
        let prefix = resource
            .get_str("prefix")
            .ok_or_else(|| format!("Mapping {} has a non-string prefix", resource.rkey))?
            .to_string();
        let service = resource
            .get_str("service")
            .ok_or_else(|| format!("Mapping {} has a non-string service", resource.rkey))?
            .to_string();

        let prefix_regex = resource.get_bool("prefix_regex").unwrap_or(false);

        if prefix_regex {
            Regex::new(&prefix)
                .map_err(|e| format!("Mapping {}: bad prefix regex: {e}", resource.rkey))?;
        } else if !prefix.starts_with('/') {
            return Err(format!(
                "Mapping {}: prefix {prefix:?} must start with /",
                resource.rkey
            ));
        }

        let host = resource.get_str("host").map(str::to_string);
        let method = resource.get_str("method").map(str::to_string);
        let group_id = group_id(method.as_deref(), host.as_deref(), &prefix);

        Ok(Self {
            name: resource.name().to_string(),
            namespace: resource.namespace().to_string(),
            cluster_name: cluster_name(&service),
            group_id,
            host,
            method,
            precedence: resource.get_i64("precedence").unwrap_or(0),
            prefix_regex,
            rewrite: resource.get_str("rewrite").map(str::to_string),
            timeout_ms: resource.get_i64("timeout_ms").or(defaults.default_timeout_ms),
            host_redirect: resource.get_str("host_redirect").map(str::to_string),
            prefix,
            service,
            cache_key: None,
        })
    }

    pub fn rkey(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

/// Stable identity of a routing group: mappings with the same method, host
/// and prefix share one group and are weighted together.
pub fn group_id(method: Option<&str>, host: Option<&str>, prefix: &str) -> String {
    let mut hasher = FxHasher::default();
    method.unwrap_or("GET").hash(&mut hasher);
    host.unwrap_or("*").hash(&mut hasher);
    prefix.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Envoy cluster names have a restricted charset; anything else maps to
/// underscore.
pub fn cluster_name(service: &str) -> String {
    let sanitized: String = service
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("cluster_{sanitized}")
}

/// Mappings sharing one (method, host, prefix) identity. Groups are
/// rebuilt every pass from their member mappings; the cached group object
/// only exists so downstream route fragments can hang invalidation links
/// off it.
#[derive(Debug, Clone, Serialize)]
pub struct IrMappingGroup {
    pub group_id: String,
    pub prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_redirect: Option<String>,
    pub mappings: Vec<IrMapping>,
}

impl IrMappingGroup {
    pub fn new(mapping: &IrMapping) -> Self {
        Self {
            group_id: mapping.group_id.clone(),
            prefix: mapping.prefix.clone(),
            host: mapping.host.clone(),
            method: mapping.method.clone(),
            host_redirect: None,
            mappings: Vec::new(),
        }
    }

    pub fn add(&mut self, mapping: IrMapping) {
        self.mappings.push(mapping);
    }

    /// Deterministic member order: highest precedence first, then name.
    pub fn finish(&mut self) {
        self.mappings
            .sort_by(|a, b| b.precedence.cmp(&a.precedence).then_with(|| a.name.cmp(&b.name)));
    }

    pub fn cache_key(&self) -> String {
        format!("MappingGroup-{}", self.group_id)
    }
}
