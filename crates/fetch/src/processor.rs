//! The Kubernetes processor family: a two-phase protocol (observe during
//! the scan, finalize once at end-of-pass) plus the aggregate, dedup and
//! counting combinators that compose per-kind processors into a pipeline.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use tiller_config::Config;
use tiller_core::{Gvk, KubeObject, NormalizedResource, ResourceKey};

use crate::dependency::Capability;
use crate::ResourceManager;

/// Mutable state shared by the pipeline for one ingestion pass.
pub struct FetchContext<'a> {
    pub aconf: &'a mut Config,
    pub manager: &'a mut ResourceManager,
}

impl FetchContext<'_> {
    pub fn emit(&mut self, resource: NormalizedResource) {
        self.manager.emit(resource);
    }
}

/// One converter from raw objects to normalized resources.
///
/// `observe` runs while the snapshot is scanned; `finalize` runs exactly
/// once afterwards, for resources that can only be materialized once the
/// scan is done (annotation documents, ingress-derived mappings, ...).
pub trait KubernetesProcessor {
    fn name(&self) -> &'static str;

    /// The resource types this processor claims.
    fn kinds(&self) -> Vec<Gvk>;

    fn provides(&self) -> Vec<Capability> {
        Vec::new()
    }

    fn wants(&self) -> Vec<Capability> {
        Vec::new()
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>);

    fn finalize(&mut self, _ctx: &mut FetchContext<'_>) {}

    /// Returns true iff this processor recognizes the object's kind. A
    /// malformed-but-recognized object is still claimed; the processor
    /// records the error against its rkey instead of rejecting it.
    fn try_process(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) -> bool {
        if !self.kinds().contains(obj.gvk()) {
            return false;
        }
        self.observe(obj, ctx);
        true
    }
}

/// Composes processors behind a single GVK dispatch table built at
/// startup. An unrecognized kind is an explicit no-handler miss, and every
/// delegate is finalized exactly once.
pub struct AggregateProcessor {
    delegates: Vec<Box<dyn KubernetesProcessor>>,
    index: FxHashMap<Gvk, Vec<usize>>,
    finalized: bool,
}

impl AggregateProcessor {
    pub fn new(delegates: Vec<Box<dyn KubernetesProcessor>>) -> Self {
        let mut index: FxHashMap<Gvk, Vec<usize>> = FxHashMap::default();
        for (i, delegate) in delegates.iter().enumerate() {
            for gvk in delegate.kinds() {
                index.entry(gvk).or_default().push(i);
            }
        }
        Self { delegates, index, finalized: false }
    }
}

impl KubernetesProcessor for AggregateProcessor {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn kinds(&self) -> Vec<Gvk> {
        let mut kinds: Vec<Gvk> = self.index.keys().cloned().collect();
        kinds.sort_by(|a, b| (&a.api_version, &a.kind).cmp(&(&b.api_version, &b.kind)));
        kinds
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        if let Some(indices) = self.index.get(obj.gvk()) {
            for &i in indices {
                self.delegates[i].try_process(obj, ctx);
            }
        }
    }

    fn try_process(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) -> bool {
        if !self.index.contains_key(obj.gvk()) {
            return false;
        }
        self.observe(obj, ctx);
        true
    }

    fn finalize(&mut self, ctx: &mut FetchContext<'_>) {
        if self.finalized {
            debug!("aggregate already finalized; skipping");
            return;
        }
        self.finalized = true;

        for delegate in &mut self.delegates {
            delegate.finalize(ctx);
        }
    }
}

/// Guarantees at-most-once processing per distinct resource key within one
/// pass. A repeat claim is a no-op that still reports success.
pub struct DeduplicatingProcessor<P> {
    delegate: P,
    seen: FxHashSet<ResourceKey>,
}

impl<P: KubernetesProcessor> DeduplicatingProcessor<P> {
    pub fn new(delegate: P) -> Self {
        Self { delegate, seen: FxHashSet::default() }
    }
}

impl<P: KubernetesProcessor> KubernetesProcessor for DeduplicatingProcessor<P> {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn kinds(&self) -> Vec<Gvk> {
        self.delegate.kinds()
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        if !self.seen.insert(obj.key()) {
            debug!(key = %obj.key(), "dropping duplicate object");
            return;
        }
        self.delegate.try_process(obj, ctx);
    }

    fn try_process(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) -> bool {
        // Claim is delegated; dedup only suppresses the second observation.
        if !self.delegate.kinds().contains(obj.gvk()) {
            return false;
        }
        self.observe(obj, ctx);
        true
    }

    fn finalize(&mut self, ctx: &mut FetchContext<'_>) {
        self.delegate.finalize(ctx);
    }
}

/// Metrics-only processor: bumps a named aconf counter per observed object.
pub struct CountingProcessor {
    gvk: Gvk,
    key: &'static str,
}

impl CountingProcessor {
    pub fn new(gvk: Gvk, key: &'static str) -> Self {
        Self { gvk, key }
    }
}

impl KubernetesProcessor for CountingProcessor {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn kinds(&self) -> Vec<Gvk> {
        vec![self.gvk.clone()]
    }

    fn observe(&mut self, _obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        ctx.aconf.incr_count(self.key);
        metrics::counter!("fetch_counted_objects_total", 1u64, "key" => self.key);
    }
}
