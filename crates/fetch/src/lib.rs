//! Tiller resource ingestion: one full pass over an input snapshot, driven
//! through the processor pipeline in dependency order.

#![forbid(unsafe_code)]

mod annotations;
mod crd;
mod dependency;
mod ingress;
mod processor;
mod service;

pub use annotations::AnnotationProcessor;
pub use crd::GatewayResourceProcessor;
pub use dependency::{Capability, DependencyError, DependencyManager};
pub use ingress::{IngressClassProcessor, IngressProcessor};
pub use processor::{
    AggregateProcessor, CountingProcessor, DeduplicatingProcessor, FetchContext,
    KubernetesProcessor,
};
pub use service::{SecretProcessor, ServiceProcessor};

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use tiller_config::Config;
use tiller_core::{Delta, KubeObject, NormalizedResource, ResourceKey, SnapshotBundle};

/// Holder for state accumulated across one ingestion pass: the emitted
/// resources plus the data provider phases make available to wanters.
#[derive(Default)]
pub struct ResourceManager {
    elements: Vec<NormalizedResource>,
    pub services: FxHashMap<ResourceKey, KubeObject>,
    pub ingress_classes: BTreeSet<String>,
    pub gateway_service: Option<ResourceKey>,
}

impl ResourceManager {
    pub fn emit(&mut self, resource: NormalizedResource) {
        debug!(rkey = %resource.rkey, kind = resource.kind(), "emit");
        self.elements.push(resource);
    }

    pub fn elements(&self) -> &[NormalizedResource] {
        &self.elements
    }
}

/// One full ingestion pass: parses a snapshot (flat object list or
/// multiplexed bundle), drives the processor pipeline in dependency order,
/// tracks the pass's deltas, and produces a deterministically sorted
/// resource list.
pub struct ResourceFetcher {
    manager: ResourceManager,
    pipeline: DeduplicatingProcessor<AggregateProcessor>,
    /// Kind-bucket walk order for bundles: provider kinds first.
    bucket_order: Vec<String>,
    deltas: Vec<Delta>,
    finalized: bool,
}

impl ResourceFetcher {
    pub fn new() -> Result<Self, DependencyError> {
        let delegates: Vec<Box<dyn KubernetesProcessor>> = vec![
            Box::new(ServiceProcessor::new()),
            Box::new(SecretProcessor::new()),
            Box::new(IngressClassProcessor::new()),
            Box::new(CountingProcessor::new(
                tiller_core::Gvk::networking("Ingress"),
                "k8s_ingress_seen",
            )),
            Box::new(IngressProcessor::new()),
            Box::new(AnnotationProcessor::new()),
            Box::new(GatewayResourceProcessor::new()),
        ];

        // Compute the dependency order over the delegates, then arrange
        // them (and the bundle walk) accordingly.
        let mut deps = DependencyManager::new();
        for d in &delegates {
            deps.register(d.name(), d.provides(), d.wants());
        }
        let order = deps.sorted_keys()?;

        let mut by_name: FxHashMap<&str, Box<dyn KubernetesProcessor>> =
            delegates.into_iter().map(|d| (d.name(), d)).collect();

        let mut ordered: Vec<Box<dyn KubernetesProcessor>> = Vec::new();
        let mut bucket_order: Vec<String> = Vec::new();
        for name in &order {
            let delegate = by_name
                .remove(name.as_str())
                .expect("dependency order names a registered processor");
            for gvk in delegate.kinds() {
                if !bucket_order.contains(&gvk.kind) {
                    bucket_order.push(gvk.kind.clone());
                }
            }
            ordered.push(delegate);
        }

        debug!(?order, ?bucket_order, "processor pipeline assembled");

        Ok(Self {
            manager: ResourceManager::default(),
            pipeline: DeduplicatingProcessor::new(AggregateProcessor::new(ordered)),
            bucket_order,
            deltas: Vec::new(),
            finalized: false,
        })
    }

    /// Feed one raw object through the pipeline. Parse failures skip the
    /// one document; the rest of the batch proceeds.
    pub fn handle_object(&mut self, aconf: &mut Config, raw: &Value) {
        let obj = match KubeObject::new(raw.clone()) {
            Ok(obj) => obj,
            Err(e) => {
                warn!(%e, "skipping unparseable object");
                return;
            }
        };

        let mut ctx = FetchContext { aconf, manager: &mut self.manager };
        if !self.pipeline.try_process(&obj, &mut ctx) {
            debug!(gvk = %obj.gvk(), rkey = %obj.rkey(), "no handler for kind");
        }
    }

    /// Parse a flat list of raw Kubernetes objects.
    pub fn parse_object_list(&mut self, aconf: &mut Config, objects: &[Value]) {
        for obj in objects {
            self.handle_object(aconf, obj);
        }
    }

    /// Parse a flat YAML/JSON stream of raw objects.
    pub fn parse_yaml(&mut self, aconf: &mut Config, serialization: &str) {
        for doc in serde_yaml::Deserializer::from_str(serialization) {
            match Value::deserialize(doc) {
                Ok(Value::Null) => {}
                Ok(value) => self.handle_object(aconf, &value),
                Err(e) => {
                    aconf.post_error(None, format!("could not parse document: {e}"));
                }
            }
        }
    }

    /// Parse a multiplexed snapshot bundle from its JSON serialization.
    pub fn parse_snapshot_str(&mut self, aconf: &mut Config, serialization: &str) {
        match SnapshotBundle::from_json(serialization) {
            Ok(bundle) => self.parse_snapshot(aconf, bundle),
            Err(e) => {
                aconf.post_error(None, format!("could not parse snapshot: {e}"));
            }
        }
    }

    /// Parse a multiplexed snapshot bundle: record its deltas, fold its
    /// invalid objects back into the kind buckets, then walk the buckets in
    /// dependency order (remaining buckets in sorted name order).
    pub fn parse_snapshot(&mut self, aconf: &mut Config, mut bundle: SnapshotBundle) {
        self.deltas = bundle.deltas().to_vec();

        // Invalid objects carry error detail their owner needs to see, so
        // they rejoin the main tree and walk the pipeline like everything
        // else. A kind-less object can't be routed at all.
        for invalid in bundle.invalid.take().into_iter().flatten() {
            let Some(kind) = invalid.get("kind").and_then(Value::as_str) else {
                warn!("skipping invalid object with no kind");
                continue;
            };
            if let Ok(obj) = KubeObject::new(invalid.clone()) {
                let detail = invalid
                    .get("errors")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected by the watch layer");
                aconf.post_error(
                    Some(obj.rkey().as_str()),
                    format!("invalid {} {}: {detail}", obj.kind(), obj.rkey()),
                );
            }
            // Buckets may hold an explicit null; replace it with a list.
            bundle
                .kubernetes
                .entry(kind.to_string())
                .or_insert(None)
                .get_or_insert_with(Vec::new)
                .push(invalid);
        }

        if bundle.consul.is_some() {
            debug!("ignoring Consul subtree in snapshot");
        }

        let mut walk: Vec<&String> = Vec::new();
        for kind in &self.bucket_order {
            if bundle.kubernetes.contains_key(kind) {
                walk.push(kind);
            }
        }
        for kind in bundle.kubernetes.keys() {
            if !walk.contains(&kind) {
                walk.push(kind);
            }
        }

        // Collect first: handle_object needs &mut self.
        let buckets: Vec<(String, Vec<Value>)> = walk
            .into_iter()
            .map(|kind| {
                (
                    kind.clone(),
                    bundle
                        .kubernetes
                        .get(kind)
                        .and_then(|b| b.clone())
                        .unwrap_or_default(),
                )
            })
            .collect();

        for (kind, objects) in buckets {
            debug!(kind = %kind, count = objects.len(), "walking bucket");
            for obj in &objects {
                self.handle_object(aconf, obj);
            }
        }
    }

    /// Run the deferred materialization phase. Called exactly once per
    /// pass; repeat calls are no-ops.
    pub fn finalize(&mut self, aconf: &mut Config) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let mut ctx = FetchContext { aconf, manager: &mut self.manager };
        self.pipeline.finalize(&mut ctx);
    }

    /// The stable, kind-clustered, name-sorted resource list. Equivalent
    /// snapshots yield byte-identical serializations of this list.
    pub fn sorted(&self) -> Vec<NormalizedResource> {
        let mut out = self.manager.elements().to_vec();
        out.sort_by(|a, b| {
            (a.kind(), a.rkey.as_str()).cmp(&(b.kind(), b.rkey.as_str()))
        });
        out
    }

    /// The deltas observed in this pass, for the IR layer's
    /// complete-vs-incremental decision.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }
}
