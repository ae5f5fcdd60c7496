//! Ingress support: IngressClass discovery plus Ingress-to-Mapping
//! conversion. Conversion is finalize-phase work because named service
//! ports can only be resolved once every Service has been seen.

use serde_json::{json, Value};
use tracing::debug;

use tiller_core::{Gvk, KubeObject, NormalizedResource, ResourceKey, INGRESS_CONTROLLER};

use crate::dependency::Capability;
use crate::processor::{FetchContext, KubernetesProcessor};

/// Legacy annotation claiming an Ingress for us.
const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const LEGACY_CLASS: &str = "tiller";

#[derive(Default)]
pub struct IngressClassProcessor;

impl IngressClassProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl KubernetesProcessor for IngressClassProcessor {
    fn name(&self) -> &'static str {
        "ingress-classes"
    }

    fn kinds(&self) -> Vec<Gvk> {
        vec![Gvk::networking("IngressClass")]
    }

    fn provides(&self) -> Vec<Capability> {
        vec![Capability::IngressClasses]
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        let controller = obj.spec().get("controller").and_then(Value::as_str);
        if controller != Some(INGRESS_CONTROLLER) {
            debug!(name = obj.name(), ?controller, "ignoring IngressClass for another controller");
            return;
        }

        ctx.aconf.incr_count("k8s_ingress_class");
        ctx.manager.ingress_classes.insert(obj.name().to_string());
    }
}

pub struct IngressProcessor {
    pending: Vec<KubeObject>,
}

impl IngressProcessor {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    fn is_ours(&self, obj: &KubeObject, ctx: &FetchContext<'_>) -> bool {
        if let Some(class) = obj.spec().get("ingressClassName").and_then(Value::as_str) {
            return ctx.manager.ingress_classes.contains(class);
        }
        obj.annotation(INGRESS_CLASS_ANNOTATION) == Some(LEGACY_CLASS)
    }

    /// Resolve a named service port number against the discovered Services.
    fn resolve_port(&self, ctx: &FetchContext<'_>, namespace: &str, service: &str, port: &Value) -> Option<i64> {
        if let Some(number) = port.get("number").and_then(Value::as_i64) {
            return Some(number);
        }

        let want = port.get("name").and_then(Value::as_str)?;
        let key = ResourceKey {
            gvk: Gvk::core("Service"),
            namespace: Some(namespace.to_string()),
            name: service.to_string(),
        };
        let svc = ctx.manager.services.get(&key)?;

        svc.spec()
            .get("ports")
            .and_then(Value::as_array)
            .and_then(|ports| {
                ports
                    .iter()
                    .find(|p| p.get("name").and_then(Value::as_str) == Some(want))
            })
            .and_then(|p| p.get("port").and_then(Value::as_i64))
    }

    fn emit_for(&self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        let namespace = obj.namespace_or_default().to_string();
        let spec = obj.spec().clone();

        // TLS entries become Hosts.
        for (i, tls) in spec
            .get("tls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let Some(hostname) = tls
                .get("hosts")
                .and_then(Value::as_array)
                .and_then(|h| h.first())
                .and_then(Value::as_str)
            else {
                continue;
            };

            ctx.emit(NormalizedResource::from_data(
                &Gvk::gateway("Host"),
                &format!("{}-tls-{i}", obj.name()),
                &namespace,
                obj.generation(),
                &obj.labels(),
                json!({
                    "hostname": hostname,
                    "tls_secret": tls.get("secretName"),
                }),
            ));
        }

        // Rules and paths become Mappings.
        for (rule_count, rule) in spec
            .get("rules")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let host = rule.get("host").and_then(Value::as_str);

            for (path_count, path) in rule
                .pointer("/http/paths")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .enumerate()
            {
                let Some(service) = path
                    .pointer("/backend/service/name")
                    .and_then(Value::as_str)
                else {
                    ctx.aconf.post_error(
                        Some(obj.rkey().as_str()),
                        format!("Ingress {} rule {rule_count} path {path_count} has no backend service", obj.rkey()),
                    );
                    continue;
                };

                let port = path
                    .pointer("/backend/service/port")
                    .map(|p| self.resolve_port(ctx, &namespace, service, p))
                    .unwrap_or(None);

                let target = match port {
                    Some(port) => format!("{service}.{namespace}:{port}"),
                    None => format!("{service}.{namespace}"),
                };

                let mut mapping = json!({
                    "prefix": path.get("path").and_then(Value::as_str).unwrap_or("/"),
                    "service": target,
                });
                if let Some(host) = host {
                    mapping["host"] = Value::String(host.to_string());
                }

                ctx.emit(NormalizedResource::from_data(
                    &Gvk::gateway("Mapping"),
                    &format!("{}-{rule_count}-{path_count}", obj.name()),
                    &namespace,
                    obj.generation(),
                    &obj.labels(),
                    mapping,
                ));
            }
        }
    }
}

impl KubernetesProcessor for IngressProcessor {
    fn name(&self) -> &'static str {
        "ingresses"
    }

    fn kinds(&self) -> Vec<Gvk> {
        vec![Gvk::networking("Ingress")]
    }

    fn wants(&self) -> Vec<Capability> {
        vec![Capability::Services, Capability::Secrets, Capability::IngressClasses]
    }

    fn observe(&mut self, obj: &KubeObject, ctx: &mut FetchContext<'_>) {
        ctx.aconf.incr_count("k8s_ingress");
        self.pending.push(obj.clone());
    }

    fn finalize(&mut self, ctx: &mut FetchContext<'_>) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|o| o.rkey());

        for obj in pending {
            if !self.is_ours(&obj, ctx) {
                debug!(rkey = %obj.rkey(), "ignoring Ingress not claimed by our class");
                continue;
            }
            self.emit_for(&obj, ctx);
        }
    }
}
