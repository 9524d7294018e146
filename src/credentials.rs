//! Credential bundle loading for mutual TLS
//!
//! The storage service's admin secret holds three PEM blobs: the CA that
//! signed the server certificate, and the client certificate/key pair the
//! verifier presents. [`load_credential_bundle`] turns them into a
//! [`CredentialBundle`]. Nothing is cached: certificates may rotate between
//! scenarios, so every verification call loads a fresh bundle.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use crate::error::{Error, Result};

/// Secret key holding the PEM-encoded CA certificate
pub const ADMIN_CA_KEY: &str = "admin-ca";

/// Secret key holding the PEM-encoded client certificate
pub const ADMIN_CERT_KEY: &str = "admin-cert";

/// Secret key holding the PEM-encoded client private key
pub const ADMIN_KEY_KEY: &str = "admin-key";

/// Read-only access to secrets, keyed by namespace and name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret's data. `Ok(None)` means the secret does not exist.
    async fn get(&self, namespace: &str, name: &str)
    -> Result<Option<BTreeMap<String, Vec<u8>>>>;
}

/// [`SecretStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let secret = secrets
            .get_opt(name)
            .await
            .map_err(|e| Error::CredentialUnavailable {
                secret: format!("{}/{}", namespace, name),
                reason: format!("Kubernetes API error: {}", e),
            })?;

        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }
}

/// Trust anchors plus the client certificate/key pair for mutual TLS.
///
/// Immutable once built; the pair is checked for consistency at
/// construction so a mismatched secret fails before any connection.
pub struct CredentialBundle {
    secret: String,
    roots: RootCertStore,
    client_chain: Vec<CertificateDer<'static>>,
    client_key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("secret", &self.secret)
            .field("roots", &self.roots.len())
            .field("client_chain", &self.client_chain.len())
            .field("client_key", &"<redacted>")
            .finish()
    }
}

impl CredentialBundle {
    /// Build a bundle from PEM blobs.
    ///
    /// `secret` names the origin ("namespace/name") for error messages.
    pub fn from_pem(secret: &str, ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let malformed = |field: &'static str, reason: String| Error::CredentialMalformed {
            secret: secret.to_string(),
            field,
            reason,
        };

        let ca_certs = parse_pem_certificates(ca_pem)
            .map_err(|reason| malformed(ADMIN_CA_KEY, reason))?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| malformed(ADMIN_CA_KEY, format!("Failed to add CA cert: {}", e)))?;
        }

        let client_chain = parse_pem_certificates(cert_pem)
            .map_err(|reason| malformed(ADMIN_CERT_KEY, reason))?;

        let client_key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
            .map_err(|e| malformed(ADMIN_KEY_KEY, format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| malformed(ADMIN_KEY_KEY, "No private key found in PEM data".into()))?;

        let provider = crypto_provider();
        let signing_key = provider
            .key_provider
            .load_private_key(client_key.clone_key())
            .map_err(|e| malformed(ADMIN_KEY_KEY, format!("Unsupported private key: {}", e)))?;
        let certified = rustls::sign::CertifiedKey::new(client_chain.clone(), signing_key);
        match certified.keys_match() {
            Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
            Err(e) => {
                return Err(malformed(
                    ADMIN_KEY_KEY,
                    format!("Client key does not match certificate: {}", e),
                ));
            }
        }

        Ok(Self {
            secret: secret.to_string(),
            roots,
            client_chain,
            client_key,
        })
    }

    /// Number of trust anchors in the bundle
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// rustls client configuration presenting the client certificate
    pub fn client_config(&self) -> Result<ClientConfig> {
        let tls_error = |e: rustls::Error| Error::CredentialMalformed {
            secret: self.secret.clone(),
            field: ADMIN_CERT_KEY,
            reason: format!("TLS configuration error: {}", e),
        };

        ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.client_chain.clone(), self.client_key.clone_key())
            .map_err(tls_error)
    }
}

/// Load the admin credential bundle from `namespace/secret_name`.
///
/// Missing secret or missing field: [`Error::CredentialUnavailable`].
/// Unparseable PEM or mismatched pair: [`Error::CredentialMalformed`].
/// No retry here; a missing credential is a fatal precondition.
pub async fn load_credential_bundle(
    store: &dyn SecretStore,
    namespace: &str,
    secret_name: &str,
) -> Result<CredentialBundle> {
    let secret = format!("{}/{}", namespace, secret_name);

    let data = store
        .get(namespace, secret_name)
        .await?
        .ok_or_else(|| Error::CredentialUnavailable {
            secret: secret.clone(),
            reason: "secret not found".to_string(),
        })?;

    let field = |key: &str| {
        data.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::CredentialUnavailable {
                secret: secret.clone(),
                reason: format!("missing required key {}", key),
            })
    };

    let ca = field(ADMIN_CA_KEY)?;
    let cert = field(ADMIN_CERT_KEY)?;
    let key = field(ADMIN_KEY_KEY)?;

    tracing::debug!(secret = %secret, "Loaded credential bundle");

    CredentialBundle::from_pem(&secret, ca, cert, key)
}

/// The process-wide rustls provider, or aws-lc-rs when none is installed
pub(crate) fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Parse PEM-encoded certificates into DER format
fn parse_pem_certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    let mut reader = std::io::BufReader::new(pem_data);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to parse certificate: {}", e))?;

    if certs.is_empty() {
        return Err("No certificates found in PEM data".to_string());
    }

    Ok(certs)
}
