//! Config documents embedded in object annotations. The documents are
//! collected during the scan and only materialized at finalize, once every
//! Service has been seen.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use tiller_core::{Gvk, KubeObject, NormalizedResource, CONFIG_ANNOTATION, GATEWAY_API_VERSION};

use crate::dependency::Capability;
use crate::processor::{FetchContext, KubernetesProcessor};

struct PendingAnnotation {
    rkey: String,
    namespace: String,
    generation: i64,
    serialization: String,
}

pub struct AnnotationProcessor {
    pending: Vec<PendingAnnotation>,
}

impl AnnotationProcessor {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    fn emit_documents(&self, pending: &PendingAnnotation, ctx: &mut FetchContext<'_>) {
        let docs = match serde_yaml::Deserializer::from_str(&pending.serialization)
            .map(Value::deserialize)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(docs) => docs,
            Err(e) => {
                ctx.aconf.post_error(
                    Some(pending.rkey.as_str()),
                    format!("could not parse config annotation: {e}"),
                );
                return;
            }
        };

        for doc in docs {
            let kind = doc.get("kind").and_then(Value::as_str);
            let name = doc.get("name").and_then(Value::as_str);

            let (Some(kind), Some(name)) = (kind, name) else {
                ctx.aconf.post_error(
                    Some(pending.rkey.as_str()),
                    "annotation document needs kind and name".to_string(),
                );
                continue;
            };

            let api_version = doc
                .get("apiVersion")
                .and_then(Value::as_str)
                .unwrap_or(GATEWAY_API_VERSION);

            let gvk = Gvk::new(api_version, kind);
            let mut spec = doc.clone();
            if let Value::Object(map) = &mut spec {
                map.remove("apiVersion");
                map.remove("kind");
                map.remove("name");
            }

            debug!(rkey = %pending.rkey, kind, name, "emitting annotation document");
            ctx.emit(NormalizedResource::from_data(
                &gvk,
                name,
                &pending.namespace,
                pending.generation,
                &[],
                spec,
            ));
        }
    }
}

impl KubernetesProcessor for AnnotationProcessor {
    fn name(&self) -> &'static str {
        "annotations"
    }

    fn kinds(&self) -> Vec<Gvk> {
        // The kinds allowed to carry embedded config.
        vec![Gvk::core("Service"), Gvk::networking("Ingress"), Gvk::gateway("Host")]
    }

    fn wants(&self) -> Vec<Capability> {
        vec![Capability::Services]
    }

    fn observe(&mut self, obj: &KubeObject, _ctx: &mut FetchContext<'_>) {
        if let Some(serialization) = obj.annotation(CONFIG_ANNOTATION) {
            self.pending.push(PendingAnnotation {
                rkey: obj.rkey(),
                namespace: obj.namespace_or_default().to_string(),
                generation: obj.generation(),
                serialization: serialization.to_string(),
            });
        }
    }

    fn finalize(&mut self, ctx: &mut FetchContext<'_>) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by(|a, b| a.rkey.cmp(&b.rkey));

        for p in &pending {
            self.emit_documents(p, ctx);
        }
    }
}
