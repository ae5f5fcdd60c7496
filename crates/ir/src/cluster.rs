//! Upstream clusters, one per distinct target service.

use serde::Serialize;

use crate::mapping::IrMapping;

#[derive(Debug, Clone, Serialize)]
pub struct IrCluster {
    pub name: String,
    /// The `service` target as written in the mapping: `name`,
    /// `name.namespace`, or `name.namespace:port`.
    pub service: String,
    pub lb_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
}

impl IrCluster {
    pub fn from_mapping(mapping: &IrMapping) -> Self {
        Self {
            name: mapping.cluster_name.clone(),
            service: mapping.service.clone(),
            lb_type: "round_robin".to_string(),
            timeout_ms: mapping.timeout_ms,
        }
    }

    pub fn cache_key(&self) -> String {
        format!("Cluster-{}", self.name)
    }

    /// host[:port] pair Envoy should dial, with the port defaulted.
    pub fn endpoint(&self) -> (String, u16) {
        match self.service.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.service.clone(), 80),
            },
            None => (self.service.clone(), 80),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(service: &str) -> IrCluster {
        IrCluster {
            name: crate::mapping::cluster_name(service),
            service: service.to_string(),
            lb_type: "round_robin".to_string(),
            timeout_ms: None,
        }
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(cluster("svc.default:8080").endpoint(), ("svc.default".into(), 8080));
        assert_eq!(cluster("svc.default").endpoint(), ("svc.default".into(), 80));
        assert_eq!(cluster("svc").endpoint(), ("svc".into(), 80));
    }
}
