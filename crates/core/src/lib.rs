//! Tiller core types: resource identities, normalized documents, deltas,
//! and the snapshot bundle format delivered by the watch layer.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

/// API group/version under which the gateway CRDs live.
pub const GATEWAY_API_VERSION: &str = "gateway.tiller.dev/v1";

/// Annotation key for config documents embedded in core objects.
pub const CONFIG_ANNOTATION: &str = "tiller.dev/config";

/// Controller name that claims IngressClass resources for us.
pub const INGRESS_CONTROLLER: &str = "tiller.dev/ingress-controller";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not a valid Kubernetes object: {0}")]
    MalformedObject(String),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(#[from] serde_json::Error),
}

/// A Kubernetes resource type: API version plus kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub api_version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// Core group: `apiVersion: v1`.
    pub fn core(kind: impl Into<String>) -> Self {
        Self::new("v1", kind)
    }

    /// Gateway CRD group.
    pub fn gateway(kind: impl Into<String>) -> Self {
        Self::new(GATEWAY_API_VERSION, kind)
    }

    pub fn networking(kind: impl Into<String>) -> Self {
        Self::new("networking.k8s.io/v1", kind)
    }

    /// The API group, if any. Back-indexed so that `apiVersion: v1` has a
    /// version but no group.
    pub fn api_group(&self) -> Option<&str> {
        match self.api_version.split_once('/') {
            Some((group, _)) => Some(group),
            None => None,
        }
    }

    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, version)) => version,
            None => &self.api_version,
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Identity of one raw resource. Cluster-scoped kinds have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}.{}", self.gvk, self.name, ns),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// A checked wrapper over one raw watched object.
///
/// Construction requires kind, apiVersion, and metadata.name; everything
/// else is optional and read straight out of the raw document.
#[derive(Debug, Clone)]
pub struct KubeObject {
    raw: Value,
    gvk: Gvk,
    name: String,
    namespace: Option<String>,
}

impl KubeObject {
    pub fn new(raw: Value) -> Result<Self, Error> {
        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedObject("missing kind".into()))?
            .to_string();
        let api_version = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedObject("missing apiVersion".into()))?
            .to_string();
        let metadata = raw
            .get("metadata")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MalformedObject("missing metadata".into()))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedObject("missing metadata.name".into()))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self { raw, gvk: Gvk::new(api_version, kind), name, namespace })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }

    pub fn generation(&self) -> i64 {
        self.raw
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1)
    }

    pub fn labels(&self) -> SmallVec<[(String, String); 8]> {
        string_map_pairs(self.raw.pointer("/metadata/labels"))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    }

    pub fn annotations(&self) -> SmallVec<[(String, String); 4]> {
        string_map_pairs(self.raw.pointer("/metadata/annotations"))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw
            .pointer("/metadata/annotations")
            .and_then(|anns| anns.get(key))
            .and_then(Value::as_str)
    }

    pub fn spec(&self) -> &Value {
        self.raw.get("spec").unwrap_or(&Value::Null)
    }

    pub fn status(&self) -> Option<&Value> {
        self.raw.get("status")
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            gvk: self.gvk.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// The resource key string used to attribute config and errors.
    pub fn rkey(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", self.name, ns),
            None => self.name.clone(),
        }
    }
}

fn string_map_pairs<A: smallvec::Array<Item = (String, String)>>(node: Option<&Value>) -> SmallVec<A> {
    let mut out = SmallVec::new();
    if let Some(map) = node.and_then(Value::as_object) {
        for (k, v) in map {
            if let Some(v) = v.as_str() {
                out.push((k.clone(), v.to_string()));
            }
        }
    }
    out
}

/// Canonical flattened document form of one watched object: kind-specific
/// spec fields hoisted to the top level, plus identity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResource {
    pub rkey: String,
    pub obj: Value,
}

impl NormalizedResource {
    pub fn from_data(
        gvk: &Gvk,
        name: &str,
        namespace: &str,
        generation: i64,
        labels: &[(String, String)],
        spec: Value,
    ) -> Self {
        let rkey = format!("{name}.{namespace}");

        let mut obj = serde_json::Map::new();
        if let Value::Object(spec) = spec {
            obj.extend(spec);
        }

        obj.insert("apiVersion".into(), Value::String(gvk.api_version.clone()));
        obj.insert("kind".into(), Value::String(gvk.kind.clone()));
        obj.insert("name".into(), Value::String(name.to_string()));
        obj.insert("namespace".into(), Value::String(namespace.to_string()));
        obj.insert("generation".into(), Value::Number(generation.into()));

        let mut label_map = serde_json::Map::new();
        for (k, v) in labels {
            label_map.insert(k.clone(), Value::String(v.clone()));
        }
        label_map.insert("tiller_crd".into(), Value::String(rkey.clone()));
        obj.insert("labels".into(), Value::Object(label_map));

        Self { rkey, obj: Value::Object(obj) }
    }

    pub fn from_object(obj: &KubeObject) -> Self {
        Self::from_data(
            obj.gvk(),
            obj.name(),
            obj.namespace_or_default(),
            obj.generation(),
            &obj.labels(),
            obj.spec().clone(),
        )
    }

    pub fn kind(&self) -> &str {
        self.obj.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.obj.get("name").and_then(Value::as_str).unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.obj.get("namespace").and_then(Value::as_str).unwrap_or("default")
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.obj.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.obj.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.obj.get(field).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.obj.get(field).and_then(Value::as_bool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaType {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "creationTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

/// One add/update/delete event for a source resource since the prior pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub kind: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: DeltaMetadata,
    #[serde(rename = "deltaType")]
    pub delta_type: DeltaType,
}

impl Delta {
    pub fn new(
        kind: &str,
        api_version: &str,
        name: &str,
        namespace: &str,
        delta_type: DeltaType,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            metadata: DeltaMetadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
                creation_timestamp: None,
            },
            delta_type,
        }
    }
}

/// The multiplexed snapshot bundle delivered by the watch layer. Every
/// subtree is explicitly optional; many keys arrive as explicit nulls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotBundle {
    #[serde(rename = "Kubernetes", default)]
    pub kubernetes: BTreeMap<String, Option<Vec<Value>>>,
    #[serde(rename = "Consul", default)]
    pub consul: Option<Value>,
    #[serde(rename = "Deltas", default)]
    pub deltas: Option<Vec<Delta>>,
    #[serde(rename = "Invalid", default)]
    pub invalid: Option<Vec<Value>>,
}

impl SnapshotBundle {
    pub fn from_json(serialization: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(serialization)?)
    }

    pub fn deltas(&self) -> &[Delta] {
        self.deltas.as_deref().unwrap_or(&[])
    }

    pub fn invalid(&self) -> &[Value] {
        self.invalid.as_deref().unwrap_or(&[])
    }
}
