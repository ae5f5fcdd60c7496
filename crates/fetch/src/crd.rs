//! Processor for the gateway's own CRDs: the kinds are emitted directly as
//! normalized resources, flattened for the aconf kind tables.

use tiller_core::{Gvk, KubeObject, NormalizedResource};

use crate::processor::{FetchContext, KubernetesProcessor};

const GATEWAY_KINDS: &[&str] = &[
    "AuthService",
    "Host",
    "Listener",
    "Mapping",
    "Module",
    "RateLimitService",
    "TLSContext",
];

#[derive(Default)]
pub struct GatewayResourceProcessor;

impl GatewayResourceProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl KubernetesProcessor for GatewayResourceProcessor {
    fn name(&self) -> &'static str {
        "gateway-crds"
    }

    fn kinds(&self) -> Vec<Gvk> {
        GATEWAY_KINDS.iter().map(|k| Gvk::gateway(*k)).collect()
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        // A recognized object with a mangled spec stays claimed: the error
        // lands on its rkey and no other processor sees it.
        let spec = obj.spec();
        if !spec.is_object() && !spec.is_null() {
            ctx.aconf.post_error(
                Some(obj.rkey().as_str()),
                format!("{} {} has a malformed spec", obj.kind(), obj.rkey()),
            );
            return;
        }

        ctx.emit(NormalizedResource::from_object(obj));
    }
}
