//! Envoy v3 config generation.
//!
//! The IR is translated fragment by fragment: one cluster document per IR
//! cluster, one route entry per mapping group. Fragments are cached and
//! linked to the IR entries they were generated from, so invalidating a
//! mapping reaches all the way down to the Envoy documents built from it.
//! Virtual hosts, listeners and the bootstrap are cheap and rebuilt every
//! pass.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use tiller_cache::Cache;
use tiller_ir::{FilterKind, Ir, IrCluster, IrListener, IrMappingGroup};

const HCM_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

/// The generated Envoy configuration for one pass.
#[derive(Debug)]
pub struct EnvoyConfig {
    bootstrap: Value,
    listeners: Vec<Value>,
    clusters: Vec<Value>,
}

impl EnvoyConfig {
    /// Translate the IR, reusing cached fragments where their sources
    /// survived invalidation.
    pub fn generate(ir: &Ir, cache: &mut Cache) -> Self {
        let clusters = generate_clusters(ir, cache);
        let routes_by_group = generate_routes(ir, cache);
        let virtual_hosts = assemble_virtual_hosts(ir, &routes_by_group);
        let listeners = generate_listeners(ir, &virtual_hosts);

        Self { bootstrap: bootstrap(), listeners, clusters }
    }

    /// The complete single-document form.
    pub fn as_value(&self) -> Value {
        let mut doc = self.bootstrap.clone();
        doc["static_resources"] = json!({
            "listeners": self.listeners,
            "clusters": self.clusters,
        });
        doc
    }

    /// The split form: bootstrap separately from the dynamic resources,
    /// for ADS-style delivery.
    pub fn split(&self) -> (Value, Value) {
        (
            self.bootstrap.clone(),
            json!({
                "listeners": self.listeners,
                "clusters": self.clusters,
            }),
        )
    }
}

fn bootstrap() -> Value {
    json!({
        "admin": {
            "access_log_path": "/dev/null",
            "address": {
                "socket_address": {"address": "127.0.0.1", "port_value": 8001}
            }
        },
        "node": {"cluster": "tiller", "id": "tiller"},
        "stats_sinks": [],
        "stats_flush_interval": "1s",
        "tracing": {},
    })
}

fn generate_clusters(ir: &Ir, cache: &mut Cache) -> Vec<Value> {
    let mut out = Vec::new();

    for cluster in ir.clusters.values() {
        let key = format!("V3-Cluster-{}", cluster.name);

        if let Some(cached) = cache.get_as::<Value>(&key) {
            out.push((*cached).clone());
            continue;
        }

        let doc = cluster_doc(cluster);
        cache.put(key.clone(), Arc::new(doc.clone()));
        cache.link(&key, &cluster.cache_key());
        out.push(doc);
    }

    out
}

fn cluster_doc(cluster: &IrCluster) -> Value {
    let (address, port) = cluster.endpoint();
    let connect_timeout = format!("{}s", cluster.timeout_ms.map_or(3, |ms| (ms + 999) / 1000));

    json!({
        "name": cluster.name,
        "type": "STRICT_DNS",
        "connect_timeout": connect_timeout,
        "lb_policy": "ROUND_ROBIN",
        "load_assignment": {
            "cluster_name": cluster.name,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": {
                        "address": {
                            "socket_address": {"address": address, "port_value": port}
                        }
                    }
                }]
            }]
        }
    })
}

/// One route entry per group, keyed by group id.
fn generate_routes(ir: &Ir, cache: &mut Cache) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();

    for group in ir.groups.values() {
        let key = format!("V3-Route-{}", group.group_id);

        if let Some(cached) = cache.get_as::<Value>(&key) {
            out.insert(group.group_id.clone(), (*cached).clone());
            continue;
        }

        debug!(group = %group.group_id, "generating route");
        let doc = route_doc(group);
        cache.put(key.clone(), Arc::new(doc.clone()));
        cache.link(&key, &group.cache_key());
        out.insert(group.group_id.clone(), doc);
    }

    out
}

fn route_doc(group: &IrMappingGroup) -> Value {
    let mut matcher = if group.mappings.iter().any(|m| m.prefix_regex) {
        json!({"safe_regex": {"regex": group.prefix}})
    } else {
        json!({"prefix": group.prefix})
    };

    if let Some(method) = &group.method {
        matcher["headers"] = json!([{"name": ":method", "exact_match": method}]);
    }

    if let Some(target) = &group.host_redirect {
        return json!({
            "match": matcher,
            "redirect": {"host_redirect": target},
        });
    }

    let action = if group.mappings.len() == 1 {
        let mapping = &group.mappings[0];
        let mut route = json!({"cluster": mapping.cluster_name});
        if let Some(rewrite) = &mapping.rewrite {
            route["prefix_rewrite"] = json!(rewrite);
        }
        if let Some(ms) = mapping.timeout_ms {
            route["timeout"] = json!(format!("{}.{:03}s", ms / 1000, ms % 1000));
        }
        route
    } else {
        // Even split across the group members; the remainder lands on the
        // first so the total is always 100.
        let n = group.mappings.len() as u64;
        let each = 100 / n;
        let clusters: Vec<Value> = group
            .mappings
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let weight = if i == 0 { each + 100 % n } else { each };
                json!({"name": m.cluster_name, "weight": weight})
            })
            .collect();
        json!({"weighted_clusters": {"clusters": clusters}})
    };

    json!({"match": matcher, "route": action})
}

/// Bucket the route entries into virtual hosts by domain. Groups without a
/// host go to the wildcard vhost; declared Hosts get a vhost even when no
/// group targets them yet.
fn assemble_virtual_hosts(ir: &Ir, routes_by_group: &BTreeMap<String, Value>) -> Vec<Value> {
    let mut by_domain: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for host in &ir.hosts {
        by_domain.entry(host.hostname.clone()).or_default();
    }

    for group in ir.groups.values() {
        let domain = group.host.clone().unwrap_or_else(|| "*".to_string());
        if let Some(route) = routes_by_group.get(&group.group_id) {
            by_domain.entry(domain).or_default().push(route.clone());
        }
    }

    by_domain.entry("*".to_string()).or_default();

    by_domain
        .into_iter()
        .map(|(domain, routes)| {
            json!({
                "name": vhost_name(&domain),
                "domains": [domain],
                "routes": routes,
            })
        })
        .collect()
}

fn vhost_name(domain: &str) -> String {
    if domain == "*" {
        "wildcard".to_string()
    } else {
        domain.replace('.', "_")
    }
}

fn generate_listeners(ir: &Ir, virtual_hosts: &[Value]) -> Vec<Value> {
    ir.listeners
        .iter()
        .map(|l| listener_doc(ir, l, virtual_hosts))
        .collect()
}

fn listener_doc(ir: &Ir, listener: &IrListener, virtual_hosts: &[Value]) -> Value {
    let mut http_filters = Vec::new();

    // Filter order is fixed: authentication, then rate limiting, then the
    // router last.
    for filter in &ir.filters {
        if filter.kind == FilterKind::ExtAuthz {
            http_filters.push(json!({
                "name": "envoy.filters.http.ext_authz",
                "typed_config": {
                    "@type": "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz",
                    "grpc_service": {
                        "envoy_grpc": {"cluster_name": filter.cluster_name}
                    }
                }
            }));
        }
    }
    for filter in &ir.filters {
        if filter.kind == FilterKind::RateLimit {
            http_filters.push(json!({
                "name": "envoy.filters.http.ratelimit",
                "typed_config": {
                    "@type": "type.googleapis.com/envoy.extensions.filters.http.ratelimit.v3.RateLimit",
                    "domain": "tiller",
                    "rate_limit_service": {
                        "grpc_service": {
                            "envoy_grpc": {"cluster_name": filter.cluster_name}
                        }
                    }
                }
            }));
        }
    }
    http_filters.push(json!({"name": "envoy.filters.http.router"}));

    json!({
        "name": listener.name,
        "address": {
            "socket_address": {"address": "0.0.0.0", "port_value": listener.port}
        },
        "filter_chains": [{
            "filters": [{
                "name": "envoy.filters.network.http_connection_manager",
                "typed_config": {
                    "@type": HCM_TYPE,
                    "stat_prefix": "ingress_http",
                    "http_filters": http_filters,
                    "route_config": {
                        "name": "tiller-routes",
                        "virtual_hosts": virtual_hosts,
                    }
                }
            }]
        }]
    })
}
