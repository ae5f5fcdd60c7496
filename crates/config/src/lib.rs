//! Tiller validated configuration ("aconf"): flattened resources indexed by
//! kind, with validation errors attached to the originating resource keys.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use tiller_core::NormalizedResource;

/// rkey under which errors that cannot be attributed to a resource land.
pub const GLOBAL_RKEY: &str = "-global-";

/// Module resource name carrying the global gateway defaults.
pub const GATEWAY_MODULE: &str = "gateway";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigError {
    pub ok: bool,
    pub error: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self { ok: false, error: message.into() }
    }
}

/// The validated, flattened configuration for one compilation pass.
///
/// Every resource that survives validation lands in `config[kind][rkey]`;
/// every resource that fails gets its failure recorded in `errors[rkey]`
/// and never reaches the IR. BTreeMaps keep iteration deterministic.
#[derive(Debug, Default)]
pub struct Config {
    config: BTreeMap<String, BTreeMap<String, NormalizedResource>>,
    errors: BTreeMap<String, Vec<ConfigError>>,
    counters: FxHashMap<String, u64>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validation error against `rkey` (or `-global-`).
    pub fn post_error(&mut self, rkey: Option<&str>, message: impl Into<String>) {
        let rkey = rkey.unwrap_or(GLOBAL_RKEY);
        let message = message.into();
        warn!(rkey, %message, "aconf error");
        self.errors
            .entry(rkey.to_string())
            .or_default()
            .push(ConfigError::new(message));
    }

    pub fn incr_count(&mut self, key: &str) {
        *self.counters.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn get_count(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Validate and store one ingestion pass worth of resources. Resources
    /// that fail the shape check are recorded in the error table only; the
    /// rest of the batch is unaffected.
    pub fn load_all(&mut self, resources: Vec<NormalizedResource>) {
        for resource in resources {
            if let Err(msg) = shape_check(&resource) {
                self.post_error(Some(resource.rkey.as_str()), msg);
                continue;
            }

            debug!(kind = resource.kind(), rkey = %resource.rkey, "aconf load");
            self.config
                .entry(resource.kind().to_string())
                .or_default()
                .insert(resource.rkey.clone(), resource);
        }
    }

    pub fn get_config(&self, kind: &str) -> Option<&BTreeMap<String, NormalizedResource>> {
        self.config.get(kind)
    }

    /// All resources of `kind`, in rkey order.
    pub fn sorted_config(&self, kind: &str) -> Vec<&NormalizedResource> {
        self.config
            .get(kind)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    /// Look up a Module resource by name (e.g. the `gateway` module).
    pub fn get_module(&self, name: &str) -> Option<&NormalizedResource> {
        self.config
            .get("Module")
            .and_then(|m| m.values().find(|r| r.name() == name))
    }

    pub fn errors(&self) -> &BTreeMap<String, Vec<ConfigError>> {
        &self.errors
    }

    pub fn has_errors(&self, rkey: &str) -> bool {
        self.errors.contains_key(rkey)
    }

    /// Sorted (rkey, message) list for the diagnostics boundary.
    pub fn error_report(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (rkey, errs) in &self.errors {
            for e in errs {
                out.push((rkey.clone(), e.error.clone()));
            }
        }
        out
    }
}

/// Per-kind required-field checks. Deep per-option semantics live in the IR
/// builders; this is only the shape every resource of the kind must have.
fn shape_check(resource: &NormalizedResource) -> Result<(), String> {
    let kind = resource.kind();

    let required: &[&str] = match kind {
        "Mapping" => &["prefix", "service"],
        "Listener" => &["port"],
        "Host" => &["hostname"],
        "AuthService" => &["auth_service"],
        "RateLimitService" => &["service"],
        _ => &[],
    };

    for field in required {
        if resource.get(field).is_none() {
            return Err(format!("{kind} {} is missing {field}", resource.rkey));
        }
    }

    if kind == "TLSContext"
        && resource.get("secret").is_none()
        && resource.get("cert_chain_file").is_none()
    {
        return Err(format!(
            "TLSContext {} needs a secret or cert_chain_file",
            resource.rkey
        ));
    }

    Ok(())
}
