//! Service and Secret processors: these provide the data other phases
//! want, so they run early in the dependency order.

use serde_json::{json, Value};
use tracing::debug;

use tiller_core::{Gvk, KubeObject, NormalizedResource};

use crate::dependency::Capability;
use crate::processor::{FetchContext, KubernetesProcessor};

/// Label value marking the gateway's own Service.
const GATEWAY_COMPONENT: &str = "gateway";

/// Discovers `v1 Service` objects. Saving them has to be deferred work:
/// the full set must be known before ingresses resolve named ports, so the
/// normalized Services are only emitted at finalize.
#[derive(Default)]
pub struct ServiceProcessor;

impl ServiceProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl KubernetesProcessor for ServiceProcessor {
    fn name(&self) -> &'static str {
        "services"
    }

    fn kinds(&self) -> Vec<Gvk> {
        vec![Gvk::core("Service")]
    }

    fn provides(&self) -> Vec<Capability> {
        vec![Capability::Services]
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        if obj
            .spec()
            .get("ports")
            .and_then(Value::as_array)
            .map_or(true, |p| p.is_empty())
        {
            debug!(rkey = %obj.rkey(), "not saving Service with no ports");
            return;
        }

        if obj.label("app.kubernetes.io/component") == Some(GATEWAY_COMPONENT) {
            debug!(rkey = %obj.rkey(), "found the gateway's own Service");
            ctx.manager.gateway_service = Some(obj.key());
        }

        ctx.manager.services.insert(obj.key(), obj.clone());
    }

    fn finalize(&mut self, ctx: &mut FetchContext<'_>) {
        let mut services: Vec<KubeObject> = ctx.manager.services.values().cloned().collect();
        services.sort_by_key(|s| s.rkey());

        for svc in services {
            ctx.emit(NormalizedResource::from_object(&svc));
        }
    }
}

/// Emits normalized Secrets carrying the cert/key payloads (still base64,
/// as delivered) for the TLS machinery to resolve.
#[derive(Default)]
pub struct SecretProcessor;

impl SecretProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl KubernetesProcessor for SecretProcessor {
    fn name(&self) -> &'static str {
        "secrets"
    }

    fn kinds(&self) -> Vec<Gvk> {
        vec![Gvk::core("Secret")]
    }

    fn provides(&self) -> Vec<Capability> {
        vec![Capability::Secrets]
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        let secret_type = obj
            .raw()
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Opaque");

        if secret_type != "kubernetes.io/tls" && secret_type != "Opaque" {
            debug!(rkey = %obj.rkey(), secret_type, "ignoring Secret of unusable type");
            return;
        }

        let data = obj.raw().get("data").cloned().unwrap_or(Value::Null);
        let tls_crt = data.get("tls.crt").and_then(Value::as_str);
        let tls_key = data.get("tls.key").and_then(Value::as_str);

        if secret_type == "kubernetes.io/tls" && tls_crt.is_none() {
            ctx.aconf.post_error(
                Some(obj.rkey().as_str()),
                format!("TLS Secret {} has no tls.crt", obj.rkey()),
            );
            return;
        }

        ctx.emit(NormalizedResource::from_data(
            &Gvk::core("Secret"),
            obj.name(),
            obj.namespace_or_default(),
            obj.generation(),
            &obj.labels(),
            json!({
                "secret_type": secret_type,
                "tls_crt": tls_crt,
                "tls_key": tls_key,
            }),
        ));
    }
}
