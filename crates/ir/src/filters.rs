//! HTTP filter chain entries sourced from AuthService and RateLimitService
//! resources. At most one of each kind is active; first in rkey order wins.

use serde::Serialize;

use tiller_core::NormalizedResource;

use crate::mapping::cluster_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    ExtAuthz,
    RateLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct IrFilter {
    pub kind: FilterKind,
    pub name: String,
    pub namespace: String,
    /// Upstream the filter calls out to.
    pub service: String,
    pub cluster_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
}

impl IrFilter {
    pub fn auth(resource: &NormalizedResource) -> Result<Self, String> {
        let service = resource
            .get_str("auth_service")
            .ok_or_else(|| format!("AuthService {} has a non-string auth_service", resource.rkey))?;
        Ok(Self::new(FilterKind::ExtAuthz, resource, service))
    }

    pub fn ratelimit(resource: &NormalizedResource) -> Result<Self, String> {
        let service = resource
            .get_str("service")
            .ok_or_else(|| format!("RateLimitService {} has a non-string service", resource.rkey))?;
        Ok(Self::new(FilterKind::RateLimit, resource, service))
    }

    fn new(kind: FilterKind, resource: &NormalizedResource, service: &str) -> Self {
        Self {
            kind,
            name: resource.name().to_string(),
            namespace: resource.namespace().to_string(),
            service: service.to_string(),
            cluster_name: cluster_name(service),
            timeout_ms: resource.get_i64("timeout_ms"),
        }
    }
}
