//! TLS material resolution. Secret lookup and file probing are boundary
//! capabilities behind traits so the compiler core stays deterministic and
//! testable without a cluster or a filesystem.

use serde::Serialize;

use tiller_config::Config;

/// Resolved TLS material, still base64 as delivered by the watch layer.
#[derive(Debug, Clone, Serialize)]
pub struct SecretInfo {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_crt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
}

/// Secret lookup boundary. `resource_rkey` names the resource asking, for
/// attribution in logs and errors.
pub trait SecretReader {
    fn load_secret(&self, resource_rkey: &str, name: &str, namespace: &str)
        -> Option<SecretInfo>;
}

/// Resolves secrets against the normalized Secret resources of one pass.
/// Takes its own snapshot of the table so the config stays free for error
/// posting while the IR builds.
pub struct AconfSecretReader {
    secrets: Vec<SecretInfo>,
}

impl AconfSecretReader {
    pub fn new(aconf: &Config) -> Self {
        let secrets = aconf
            .sorted_config("Secret")
            .into_iter()
            .map(|r| SecretInfo {
                name: r.name().to_string(),
                namespace: r.namespace().to_string(),
                tls_crt: r.get_str("tls_crt").map(str::to_string),
                tls_key: r.get_str("tls_key").map(str::to_string),
            })
            .collect();
        Self { secrets }
    }
}

impl SecretReader for AconfSecretReader {
    fn load_secret(
        &self,
        _resource_rkey: &str,
        name: &str,
        namespace: &str,
    ) -> Option<SecretInfo> {
        // `name` may carry its own namespace as `name.namespace`.
        let (name, namespace) = match name.rsplit_once('.') {
            Some((n, ns)) => (n, ns),
            None => (name, namespace),
        };

        self.secrets
            .iter()
            .find(|s| s.name == name && s.namespace == namespace)
            .cloned()
    }
}

/// A TLSContext resource with its material resolved.
#[derive(Debug, Clone, Serialize)]
pub struct IrTlsContext {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_chain_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_info: Option<SecretInfo>,
}

/// Reader that never finds anything, for tests and dry runs.
pub struct NullSecretReader;

impl SecretReader for NullSecretReader {
    fn load_secret(&self, _: &str, _: &str, _: &str) -> Option<SecretInfo> {
        None
    }
}

/// Filesystem probe boundary for file-based TLS configuration.
pub trait FileChecker {
    fn file_exists(&self, path: &str) -> bool;
}

pub struct RealFileChecker;

impl FileChecker for RealFileChecker {
    fn file_exists(&self, path: &str) -> bool {
        std::path::Path::new(path).is_file()
    }
}

/// Probe that finds nothing, for tests and dry runs.
pub struct NullFileChecker;

impl FileChecker for NullFileChecker {
    fn file_exists(&self, _path: &str) -> bool {
        false
    }
}
