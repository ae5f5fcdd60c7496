//! Tiller intermediate representation.
//!
//! One `Ir` is the semantic routing model for one compilation pass: hosts,
//! listeners, filters, mapping groups and clusters, built from the
//! validated config with per-mapping reuse out of the build cache. The
//! complete-vs-incremental decision for a pass also lives here, in
//! [`check_deltas`].

#![forbid(unsafe_code)]

pub mod cluster;
pub mod filters;
pub mod host;
pub mod listener;
pub mod mapping;
pub mod tls;

pub use cluster::IrCluster;
pub use filters::{FilterKind, IrFilter};
pub use host::IrHost;
pub use listener::IrListener;
pub use mapping::{IrMapping, IrMappingGroup};
pub use tls::{
    AconfSecretReader, FileChecker, IrTlsContext, NullFileChecker, NullSecretReader,
    RealFileChecker, SecretInfo, SecretReader,
};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use tiller_cache::Cache;
use tiller_config::{Config, GATEWAY_MODULE};
use tiller_core::Delta;

/// Resource kinds whose deltas can be applied incrementally. Any delta of
/// another kind forces a complete rebuild.
pub const CACHEABLE_KINDS: &[&str] = &["Mapping"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Complete,
    Incremental,
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigType::Complete => write!(f, "complete"),
            ConfigType::Incremental => write!(f, "incremental"),
        }
    }
}

/// Outcome of the per-pass delta check.
#[derive(Debug, Clone)]
pub struct DeltaCheck {
    pub config_type: ConfigType,
    /// Whether the cache was reset as part of the decision.
    pub reset_cache: bool,
    /// Mapping cache keys whose groups must be invalidated during the
    /// build, even where the group itself would otherwise be reused.
    pub invalidate_groups_for: Vec<String>,
}

impl DeltaCheck {
    fn complete(reset_cache: bool) -> Self {
        Self {
            config_type: ConfigType::Complete,
            reset_cache,
            invalidate_groups_for: Vec::new(),
        }
    }
}

/// Decide whether this pass can rebuild incrementally.
///
/// Incremental is only claimed when every delta names a cacheable kind and
/// the cache has prior state to lean on; everything else resets the cache
/// and rebuilds from scratch. The affected mapping entries are invalidated
/// here, before the build reads the cache.
pub fn check_deltas(
    deltas: &[Delta],
    cache: Option<&mut Cache>,
    sanity_check_due: bool,
) -> DeltaCheck {
    let Some(cache) = cache else {
        return DeltaCheck::complete(false);
    };

    if sanity_check_due {
        info!("sanity check due, resetting cache");
        cache.reset();
        return DeltaCheck::complete(true);
    }

    if cache.is_empty() {
        cache.reset();
        return DeltaCheck::complete(true);
    }

    for delta in deltas {
        if !CACHEABLE_KINDS.contains(&delta.kind.as_str()) || delta.metadata.name.is_empty() {
            debug!(kind = %delta.kind, "delta forces complete rebuild");
            cache.reset();
            return DeltaCheck::complete(true);
        }
    }

    let mut invalidate_groups_for = Vec::new();
    for delta in deltas {
        let namespace = if delta.metadata.namespace.is_empty() {
            "default"
        } else {
            delta.metadata.namespace.as_str()
        };
        let key = format!("{}-v1-{}-{namespace}", delta.kind, delta.metadata.name);
        cache.invalidate(&key);
        invalidate_groups_for.push(key);
    }

    DeltaCheck {
        config_type: ConfigType::Incremental,
        reset_cache: false,
        invalidate_groups_for,
    }
}

/// Global defaults out of the `gateway` Module.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IrDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<i64>,
}

impl IrDefaults {
    fn from_config(aconf: &Config) -> Self {
        let Some(module) = aconf.get_module(GATEWAY_MODULE) else {
            return Self::default();
        };
        let config = module.get("config").cloned().unwrap_or(Value::Null);

        Self {
            default_timeout_ms: config.get("default_timeout_ms").and_then(Value::as_i64),
        }
    }
}

/// The compiled semantic model for one pass.
#[derive(Debug, Serialize)]
pub struct Ir {
    pub defaults: IrDefaults,
    pub hosts: Vec<IrHost>,
    pub tls_contexts: Vec<IrTlsContext>,
    pub listeners: Vec<IrListener>,
    pub filters: Vec<IrFilter>,
    pub groups: BTreeMap<String, IrMappingGroup>,
    pub clusters: BTreeMap<String, IrCluster>,
}

impl Ir {
    /// Compile the validated config. Invalid resources error against their
    /// rkey and drop out; the rest of the config still compiles.
    pub fn new(
        aconf: &mut Config,
        cache: &mut Cache,
        invalidate_groups_for: &[String],
        secret_reader: &dyn SecretReader,
        file_checker: &dyn FileChecker,
    ) -> Self {
        let defaults = IrDefaults::from_config(aconf);

        let tls_contexts = build_tls_contexts(aconf, secret_reader, file_checker);
        let hosts = build_hosts(aconf, secret_reader);
        let listeners = build_listeners(aconf);
        let filters = build_filters(aconf);
        let (groups, clusters) =
            build_groups(aconf, cache, &defaults, invalidate_groups_for);

        Self { defaults, hosts, tls_contexts, listeners, filters, groups, clusters }
    }

    pub fn as_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

fn build_tls_contexts(
    aconf: &mut Config,
    secret_reader: &dyn SecretReader,
    file_checker: &dyn FileChecker,
) -> Vec<IrTlsContext> {
    let resources: Vec<_> =
        aconf.sorted_config("TLSContext").into_iter().cloned().collect();
    let mut out = Vec::new();

    for resource in resources {
        let hosts = resource
            .get("hosts")
            .and_then(Value::as_array)
            .map(|h| {
                h.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut ctx = IrTlsContext {
            name: resource.name().to_string(),
            namespace: resource.namespace().to_string(),
            hosts,
            secret: resource.get_str("secret").map(str::to_string),
            cert_chain_file: resource.get_str("cert_chain_file").map(str::to_string),
            private_key_file: resource.get_str("private_key_file").map(str::to_string),
            secret_info: None,
        };

        if let Some(secret) = &ctx.secret {
            match secret_reader.load_secret(&resource.rkey, secret, &ctx.namespace) {
                Some(info) if info.tls_crt.is_some() => ctx.secret_info = Some(info),
                _ => {
                    aconf.post_error(
                        Some(resource.rkey.as_str()),
                        format!("TLSContext {}: no such secret {secret}", resource.rkey),
                    );
                    continue;
                }
            }
        } else if let Some(cert) = &ctx.cert_chain_file {
            if !file_checker.file_exists(cert) {
                aconf.post_error(
                    Some(resource.rkey.as_str()),
                    format!("TLSContext {}: cert_chain_file {cert} does not exist", resource.rkey),
                );
                continue;
            }
        }

        out.push(ctx);
    }

    out
}

fn build_hosts(aconf: &mut Config, secret_reader: &dyn SecretReader) -> Vec<IrHost> {
    let resources: Vec<_> = aconf.sorted_config("Host").into_iter().cloned().collect();
    let mut out = Vec::new();

    for resource in resources {
        let mut host = match IrHost::from_resource(&resource) {
            Ok(host) => host,
            Err(msg) => {
                aconf.post_error(Some(resource.rkey.as_str()), msg);
                continue;
            }
        };

        if let Some(secret) = &host.tls_secret {
            match secret_reader.load_secret(&resource.rkey, secret, &host.namespace) {
                Some(info) if info.tls_crt.is_some() => host.tls_active = true,
                _ => {
                    aconf.post_error(
                        Some(resource.rkey.as_str()),
                        format!("Host {}: no such TLS secret {secret}", resource.rkey),
                    );
                    // The host still serves, just without TLS.
                }
            }
        }

        out.push(host);
    }

    out
}

fn build_listeners(aconf: &mut Config) -> Vec<IrListener> {
    let resources: Vec<_> = aconf.sorted_config("Listener").into_iter().cloned().collect();
    let mut out = Vec::new();

    for resource in resources {
        match IrListener::from_resource(&resource) {
            Ok(listener) => out.push(listener),
            Err(msg) => aconf.post_error(Some(resource.rkey.as_str()), msg),
        }
    }

    if out.is_empty() {
        debug!("no listeners configured, synthesizing default-http");
        out.push(IrListener::default_http());
    }

    out
}

/// At most one active filter per kind; the first in rkey order wins and
/// later declarations error.
fn build_filters(aconf: &mut Config) -> Vec<IrFilter> {
    type FilterBuilder = fn(&tiller_core::NormalizedResource) -> Result<IrFilter, String>;

    let mut out = Vec::new();

    let table: [(&str, FilterBuilder); 2] = [
        ("AuthService", IrFilter::auth),
        ("RateLimitService", IrFilter::ratelimit),
    ];

    for (kind, build) in table {
        let resources: Vec<_> = aconf.sorted_config(kind).into_iter().cloned().collect();
        let mut winner: Option<String> = None;

        for resource in resources {
            if let Some(active) = &winner {
                aconf.post_error(
                    Some(resource.rkey.as_str()),
                    format!("{kind} {} ignored: {active} is already active", resource.rkey),
                );
                continue;
            }

            match build(&resource) {
                Ok(filter) => {
                    winner = Some(resource.rkey.clone());
                    out.push(filter);
                }
                Err(msg) => aconf.post_error(Some(resource.rkey.as_str()), msg),
            }
        }
    }

    out
}

/// Compile mappings with cache reuse, then bucket them into groups and
/// derive the clusters. Groups are rebuilt every pass; mappings and
/// clusters come out of the cache when their entries survived invalidation.
fn build_groups(
    aconf: &mut Config,
    cache: &mut Cache,
    defaults: &IrDefaults,
    invalidate_groups_for: &[String],
) -> (BTreeMap<String, IrMappingGroup>, BTreeMap<String, IrCluster>) {
    let resources: Vec<_> = aconf.sorted_config("Mapping").into_iter().cloned().collect();

    let mut mappings: Vec<IrMapping> = Vec::new();
    for resource in resources {
        let key = format!("Mapping-v1-{}-{}", resource.name(), resource.namespace());

        if let Some(cached) = cache.get_as::<IrMapping>(&key) {
            mappings.push((*cached).clone());
            continue;
        }

        match IrMapping::from_resource(&resource, defaults) {
            Ok(mut mapping) => {
                mapping.cache_key = Some(key.clone());
                cache.put(key, Arc::new(mapping.clone()));
                mappings.push(mapping);
            }
            Err(msg) => aconf.post_error(Some(resource.rkey.as_str()), msg),
        }
    }

    let mut groups: BTreeMap<String, IrMappingGroup> = BTreeMap::new();
    let mut clusters: BTreeMap<String, IrCluster> = BTreeMap::new();

    for mapping in mappings {
        let group = groups
            .entry(mapping.group_id.clone())
            .or_insert_with(|| IrMappingGroup::new(&mapping));
        let gkey = group.cache_key();

        if let Some(mk) = &mapping.cache_key {
            if invalidate_groups_for.contains(mk) {
                debug!(group = %gkey, mapping = %mk, "invalidating group for changed mapping");
                cache.invalidate(&gkey);
            }
        }

        if let Some(redirect) = &mapping.host_redirect {
            if let Some(active) = &group.host_redirect {
                aconf.post_error(
                    Some(mapping.rkey().as_str()),
                    format!(
                        "Mapping {}: group already redirects via {active}, ignoring",
                        mapping.rkey()
                    ),
                );
                continue;
            }
            group.host_redirect = Some(redirect.clone());
        }

        let cluster = IrCluster::from_mapping(&mapping);
        let ckey = cluster.cache_key();
        if let Some(mk) = &mapping.cache_key {
            cache.link(&gkey, mk);
            cache.link(&ckey, mk);
        }
        clusters.entry(cluster.name.clone()).or_insert(cluster);

        group.add(mapping);
    }

    for group in groups.values_mut() {
        group.finish();
        cache.put(group.cache_key(), Arc::new(group.clone()));
    }
    for cluster in clusters.values() {
        if !cache.contains(&cluster.cache_key()) {
            cache.put(cluster.cache_key(), Arc::new(cluster.clone()));
        }
    }

    (groups, clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiller_core::{DeltaType, Gvk, NormalizedResource};

    fn mapping(name: &str, spec: Value) -> NormalizedResource {
        NormalizedResource::from_data(&Gvk::gateway("Mapping"), name, "default", 1, &[], spec)
    }

    fn build(aconf: &mut Config, cache: &mut Cache) -> Ir {
        Ir::new(aconf, cache, &[], &NullSecretReader, &NullFileChecker)
    }

    #[test]
    fn mappings_with_one_prefix_share_a_group() {
        let mut aconf = Config::new();
        aconf.load_all(vec![
            mapping("a", json!({"prefix": "/shared/", "service": "a-svc", "precedence": 1})),
            mapping("b", json!({"prefix": "/shared/", "service": "b-svc", "precedence": 5})),
            mapping("c", json!({"prefix": "/other/", "service": "c-svc"})),
        ]);

        let ir = build(&mut aconf, &mut Cache::new());
        assert_eq!(ir.groups.len(), 2);
        assert_eq!(ir.clusters.len(), 3);

        let shared = ir
            .groups
            .values()
            .find(|g| g.prefix == "/shared/")
            .unwrap();
        let names: Vec<&str> = shared.mappings.iter().map(|m| m.name.as_str()).collect();
        // Highest precedence first.
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn bad_prefix_drops_only_that_mapping() {
        let mut aconf = Config::new();
        aconf.load_all(vec![
            mapping("bad", json!({"prefix": "no-slash", "service": "x"})),
            mapping("good", json!({"prefix": "/ok/", "service": "y"})),
        ]);

        let ir = build(&mut aconf, &mut Cache::new());
        assert_eq!(ir.groups.len(), 1);
        assert!(aconf.has_errors("bad.default"));
    }

    #[test]
    fn module_defaults_flow_into_mappings() {
        let mut aconf = Config::new();
        aconf.load_all(vec![
            NormalizedResource::from_data(
                &Gvk::gateway("Module"),
                GATEWAY_MODULE,
                "default",
                1,
                &[],
                json!({"config": {"default_timeout_ms": 2500}}),
            ),
            mapping("m", json!({"prefix": "/m/", "service": "m-svc"})),
        ]);

        let ir = build(&mut aconf, &mut Cache::new());
        let group = ir.groups.values().next().unwrap();
        assert_eq!(group.mappings[0].timeout_ms, Some(2500));
    }

    #[test]
    fn listeners_default_when_unconfigured() {
        let mut aconf = Config::new();
        let ir = build(&mut aconf, &mut Cache::new());
        assert_eq!(ir.listeners.len(), 1);
        assert!(ir.listeners[0].synthesized);
        assert_eq!(ir.listeners[0].port, listener::DEFAULT_HTTP_PORT);
    }

    #[test]
    fn second_auth_service_errors_and_is_ignored() {
        let mut aconf = Config::new();
        aconf.load_all(vec![
            NormalizedResource::from_data(
                &Gvk::gateway("AuthService"),
                "auth-a",
                "default",
                1,
                &[],
                json!({"auth_service": "auth-a-svc"}),
            ),
            NormalizedResource::from_data(
                &Gvk::gateway("AuthService"),
                "auth-b",
                "default",
                1,
                &[],
                json!({"auth_service": "auth-b-svc"}),
            ),
        ]);

        let ir = build(&mut aconf, &mut Cache::new());
        assert_eq!(ir.filters.len(), 1);
        assert_eq!(ir.filters[0].name, "auth-a");
        assert!(aconf.has_errors("auth-b.default"));
    }

    #[test]
    fn check_deltas_with_no_cache_is_complete() {
        let check = check_deltas(&[], None, false);
        assert_eq!(check.config_type, ConfigType::Complete);
        assert!(!check.reset_cache);
    }

    #[test]
    fn check_deltas_on_empty_cache_is_complete() {
        let mut cache = Cache::new();
        let deltas = vec![Delta::new(
            "Mapping",
            tiller_core::GATEWAY_API_VERSION,
            "foo",
            "default",
            DeltaType::Update,
        )];

        let check = check_deltas(&deltas, Some(&mut cache), false);
        assert_eq!(check.config_type, ConfigType::Complete);
        assert!(check.reset_cache);
    }

    #[test]
    fn mapping_deltas_go_incremental_and_invalidate() {
        let mut cache = Cache::new();
        cache.put("Mapping-v1-foo-default", Arc::new(17usize));
        cache.put("Mapping-v1-bar-default", Arc::new(17usize));

        let deltas = vec![Delta::new(
            "Mapping",
            tiller_core::GATEWAY_API_VERSION,
            "foo",
            "default",
            DeltaType::Update,
        )];

        let check = check_deltas(&deltas, Some(&mut cache), false);
        assert_eq!(check.config_type, ConfigType::Incremental);
        assert_eq!(check.invalidate_groups_for, vec!["Mapping-v1-foo-default"]);
        assert!(!cache.contains("Mapping-v1-foo-default"));
        assert!(cache.contains("Mapping-v1-bar-default"));
    }

    #[test]
    fn non_cacheable_delta_forces_complete_and_reset() {
        let mut cache = Cache::new();
        cache.put("Mapping-v1-foo-default", Arc::new(17usize));

        let deltas = vec![Delta::new("Host", tiller_core::GATEWAY_API_VERSION, "h", "default", DeltaType::Add)];

        let check = check_deltas(&deltas, Some(&mut cache), false);
        assert_eq!(check.config_type, ConfigType::Complete);
        assert!(check.reset_cache);
        assert!(cache.is_empty());
    }

    #[test]
    fn sanity_check_forces_complete_and_reset() {
        let mut cache = Cache::new();
        cache.put("Mapping-v1-foo-default", Arc::new(17usize));

        let check = check_deltas(&[], Some(&mut cache), true);
        assert_eq!(check.config_type, ConfigType::Complete);
        assert!(check.reset_cache);
        assert!(cache.is_empty());
    }

    #[test]
    fn warm_rebuild_reuses_cached_mappings() {
        let mut aconf = Config::new();
        aconf.load_all(vec![mapping("m", json!({"prefix": "/m/", "service": "m-svc"}))]);

        let mut cache = Cache::new();
        build(&mut aconf, &mut cache);
        let cold_misses = cache.stats().misses;

        build(&mut aconf, &mut cache);
        let stats = cache.stats();
        assert!(stats.hits >= 1, "second pass should hit the mapping entry");
        assert_eq!(stats.misses, cold_misses, "second pass should add no misses");
    }
}
