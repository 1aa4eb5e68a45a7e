//! CredHub secret interpolation
//!
//! `VCAP_SERVICES` may carry `{"credhub-ref": "..."}` placeholders instead
//! of literal credentials. When a CredHub endpoint is configured through
//! platform options, the whole document is sent to CredHub once and
//! replaced with the interpolated result.
//!
//! # Fast path
//!
//! No request is made when interpolation is explicitly skipped or the
//! document contains no `credhub-ref` marker at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, StatusCode};
use url::Url;

use crate::config::CredHubConfig;
use crate::environment::{EnvironmentSet, VCAP_SERVICES};
use crate::{Error, Result};

/// Marker key of a secret reference inside a services document
pub const CREDHUB_REF_MARKER: &str = "\"credhub-ref\"";

pub const SKIP_INTERPOLATION_VAR: &str = "CREDHUB_SKIP_INTERPOLATION";
pub const INSTANCE_CERT_VAR: &str = "CF_INSTANCE_CERT";
pub const INSTANCE_KEY_VAR: &str = "CF_INSTANCE_KEY";
pub const SYSTEM_CERT_PATH_VAR: &str = "CF_SYSTEM_CERT_PATH";

/// Client identity used to authenticate against the secret manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// PEM certificate file
    pub cert_path: PathBuf,
    /// PEM private key file
    pub key_path: PathBuf,
    /// Directory of PEM trust roots
    pub trust_roots: PathBuf,
}

impl ClientIdentity {
    /// Collect identity material from the environment set.
    ///
    /// Only checks presence; the files are read by the client.
    pub fn from_env(env: &EnvironmentSet) -> Result<Self> {
        let cert = env.get_non_empty(INSTANCE_CERT_VAR);
        let key = env.get_non_empty(INSTANCE_KEY_VAR);
        let (cert, key) = match (cert, key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(Error::MissingCredentialMaterial(format!(
                    "{} and/or {} not set",
                    INSTANCE_CERT_VAR, INSTANCE_KEY_VAR
                )))
            }
        };
        let trust_roots = env.get_non_empty(SYSTEM_CERT_PATH_VAR).ok_or_else(|| {
            Error::MissingCredentialMaterial(format!("{} not set", SYSTEM_CERT_PATH_VAR))
        })?;

        Ok(Self {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
            trust_roots: PathBuf::from(trust_roots),
        })
    }
}

/// A secret manager able to resolve `credhub-ref` placeholders
#[async_trait]
pub trait SecretManager: Send + Sync {
    /// Interpolate every reference in `document`, returning the new document
    async fn interpolate(
        &self,
        endpoint: &Url,
        identity: &ClientIdentity,
        document: &str,
    ) -> Result<String>;
}

/// Why interpolation did not contact the secret manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `CREDHUB_SKIP_INTERPOLATION` is set
    Disabled,
    /// No secret manager endpoint in platform options
    NoEndpoint,
    /// No services document bound
    NoServices,
    /// Document has no `credhub-ref` marker
    NoReferences,
}

/// Outcome of [`SecretInterpolator::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Skipped(SkipReason),
    Applied,
}

/// Rewrites `VCAP_SERVICES` in an environment set through a secret manager
pub struct SecretInterpolator<'a> {
    manager: &'a dyn SecretManager,
}

impl<'a> SecretInterpolator<'a> {
    pub fn new(manager: &'a dyn SecretManager) -> Self {
        Self { manager }
    }

    /// Decide whether a request is needed, returning what it needs if so
    fn plan<'e>(
        env: &'e EnvironmentSet,
        endpoint: Option<&'e Url>,
    ) -> std::result::Result<(&'e Url, &'e str), SkipReason> {
        if env.contains(SKIP_INTERPOLATION_VAR) {
            return Err(SkipReason::Disabled);
        }
        let services = env
            .get_non_empty(VCAP_SERVICES)
            .ok_or(SkipReason::NoServices)?;
        if !services.contains(CREDHUB_REF_MARKER) {
            return Err(SkipReason::NoReferences);
        }
        let endpoint = endpoint.ok_or(SkipReason::NoEndpoint)?;
        Ok((endpoint, services))
    }

    /// Interpolate `VCAP_SERVICES` in place.
    ///
    /// The document is only replaced when the secret manager returned a
    /// complete result; on error the environment set is untouched.
    pub async fn run(&self, env: &mut EnvironmentSet, endpoint: Option<&Url>) -> Result<Interpolation> {
        let (endpoint, services) = match Self::plan(env, endpoint) {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::debug!(?reason, "skipping credhub interpolation");
                return Ok(Interpolation::Skipped(reason));
            }
        };

        let identity = ClientIdentity::from_env(env)?;
        tracing::info!(endpoint = %endpoint, bytes = services.len(), "interpolating credhub references");

        let interpolated = self.manager.interpolate(endpoint, &identity, services).await?;
        env.set(VCAP_SERVICES, interpolated);
        Ok(Interpolation::Applied)
    }
}

/// [`SecretManager`] backed by the CredHub HTTP API using mutual TLS
pub struct CredHubClient {
    config: CredHubConfig,
}

impl CredHubClient {
    pub fn new(config: CredHubConfig) -> Self {
        Self { config }
    }

    async fn build_client(&self, identity: &ClientIdentity) -> Result<Client> {
        let cert = read_material(&identity.cert_path).await?;
        let key = read_material(&identity.key_path).await?;
        let mut pem = cert;
        pem.push(b'\n');
        pem.extend_from_slice(&key);
        let identity_pem = Identity::from_pem(&pem)
            .map_err(|e| Error::Interpolation(format!("invalid instance identity: {}", e)))?;

        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .identity(identity_pem);
        for root in load_trust_roots(&identity.trust_roots).await? {
            builder = builder.add_root_certificate(root);
        }

        builder
            .build()
            .map_err(|e| Error::Interpolation(format!("failed to create HTTP client: {}", e)))
    }

    fn interpolate_url(&self, endpoint: &Url) -> Result<Url> {
        endpoint
            .join(&self.config.interpolate_path)
            .map_err(|e| Error::Interpolation(format!("invalid interpolate endpoint: {}", e)))
    }
}

#[async_trait]
impl SecretManager for CredHubClient {
    async fn interpolate(
        &self,
        endpoint: &Url,
        identity: &ClientIdentity,
        document: &str,
    ) -> Result<String> {
        let body: serde_json::Value =
            serde_json::from_str(document).map_err(|e| Error::parse("VCAP_SERVICES", e))?;
        let client = self.build_client(identity).await?;
        let url = self.interpolate_url(endpoint)?;

        let response = client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Interpolation(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Interpolation(format!("failed to read response from {}: {}", url, e)))?;
        interpolated_document(&url, status, &text)
    }
}

/// Turn a CredHub interpolate response into the replacement document
fn interpolated_document(url: &Url, status: StatusCode, body: &str) -> Result<String> {
    if !status.is_success() {
        return Err(Error::Interpolation(format!(
            "{} returned HTTP status {}: {}",
            url,
            status.as_u16(),
            body.trim()
        )));
    }

    let interpolated: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::Interpolation(format!("invalid response body: {}", e)))?;
    if !interpolated.is_object() {
        return Err(Error::Interpolation("response body is not a JSON object".into()));
    }
    Ok(interpolated.to_string())
}

async fn read_material(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::MissingCredentialMaterial(format!("unable to read {}: {}", path.display(), e))
    })
}

/// Load every PEM file in `dir` as a trust root
async fn load_trust_roots(dir: &Path) -> Result<Vec<Certificate>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        Error::MissingCredentialMaterial(format!("unable to read {}: {}", dir.display(), e))
    })?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut roots = Vec::with_capacity(paths.len());
    for path in paths {
        let pem = tokio::fs::read(&path).await?;
        match Certificate::from_pem(&pem) {
            Ok(cert) => roots.push(cert),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable trust root"),
        }
    }

    if roots.is_empty() {
        return Err(Error::MissingCredentialMaterial(format!(
            "no trust roots found in {}",
            dir.display()
        )));
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records calls and returns a canned document
    struct FakeSecretManager {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        response: Result<String>,
    }

    impl FakeSecretManager {
        fn returning(doc: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                response: Ok(doc.to_string()),
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                response: Err(Error::Interpolation("connection refused".into())),
            }
        }
    }

    #[async_trait]
    impl SecretManager for FakeSecretManager {
        async fn interpolate(&self, _: &Url, _: &ClientIdentity, document: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(document.to_string());
            match &self.response {
                Ok(doc) => Ok(doc.clone()),
                Err(e) => Err(Error::Interpolation(e.to_string())),
            }
        }
    }

    const REF_DOC: &str = r#"{"p-db":[{"credentials":{"credhub-ref":"/c/db"}}]}"#;
    const RESOLVED_DOC: &str = r#"{"p-db":[{"credentials":{"uri":"mysql://resolved"}}]}"#;

    fn endpoint() -> Url {
        Url::parse("https://credhub.service.internal:8844").unwrap()
    }

    fn env_with_identity(services: &str) -> EnvironmentSet {
        EnvironmentSet::from_vars([
            ("VCAP_SERVICES", services),
            (INSTANCE_CERT_VAR, "/etc/cf-instance-credentials/instance.crt"),
            (INSTANCE_KEY_VAR, "/etc/cf-instance-credentials/instance.key"),
            (SYSTEM_CERT_PATH_VAR, "/etc/cf-system-certificates"),
        ])
    }

    #[tokio::test]
    async fn test_no_marker_never_calls_manager() {
        let fake = FakeSecretManager::returning(RESOLVED_DOC);
        let doc = r#"{"p-db":[{"credentials":{"uri":"mysql://literal"}}]}"#;
        let mut env = env_with_identity(doc);

        let outcome = SecretInterpolator::new(&fake).run(&mut env, Some(&endpoint())).await.unwrap();

        assert_eq!(outcome, Interpolation::Skipped(SkipReason::NoReferences));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.get("VCAP_SERVICES"), Some(doc));
    }

    #[tokio::test]
    async fn test_skip_flag_never_calls_manager() {
        let fake = FakeSecretManager::returning(RESOLVED_DOC);
        let mut env = env_with_identity(REF_DOC);
        env.set(SKIP_INTERPOLATION_VAR, "");

        let outcome = SecretInterpolator::new(&fake).run(&mut env, Some(&endpoint())).await.unwrap();

        assert_eq!(outcome, Interpolation::Skipped(SkipReason::Disabled));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.get("VCAP_SERVICES"), Some(REF_DOC));
    }

    #[tokio::test]
    async fn test_no_endpoint_never_calls_manager() {
        let fake = FakeSecretManager::returning(RESOLVED_DOC);
        let mut env = env_with_identity(REF_DOC);

        let outcome = SecretInterpolator::new(&fake).run(&mut env, None).await.unwrap();

        assert_eq!(outcome, Interpolation::Skipped(SkipReason::NoEndpoint));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interpolation_replaces_document() {
        let fake = FakeSecretManager::returning(RESOLVED_DOC);
        let mut env = env_with_identity(REF_DOC);

        let outcome = SecretInterpolator::new(&fake).run(&mut env, Some(&endpoint())).await.unwrap();

        assert_eq!(outcome, Interpolation::Applied);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.seen.lock().unwrap().as_slice(), [REF_DOC.to_string()]);
        assert_eq!(env.get("VCAP_SERVICES"), Some(RESOLVED_DOC));
    }

    #[tokio::test]
    async fn test_missing_identity_material() {
        let fake = FakeSecretManager::returning(RESOLVED_DOC);

        let mut env = env_with_identity(REF_DOC);
        env.remove(INSTANCE_KEY_VAR);
        let err = SecretInterpolator::new(&fake).run(&mut env, Some(&endpoint())).await.unwrap_err();
        assert!(matches!(err, Error::MissingCredentialMaterial(_)));

        let mut env = env_with_identity(REF_DOC);
        env.set(SYSTEM_CERT_PATH_VAR, "");
        let err = SecretInterpolator::new(&fake).run(&mut env, Some(&endpoint())).await.unwrap_err();
        assert!(matches!(err, Error::MissingCredentialMaterial(_)));

        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.get("VCAP_SERVICES"), Some(REF_DOC));
    }

    #[tokio::test]
    async fn test_failure_leaves_document_untouched() {
        let fake = FakeSecretManager::failing();
        let mut env = env_with_identity(REF_DOC);

        let err = SecretInterpolator::new(&fake).run(&mut env, Some(&endpoint())).await.unwrap_err();

        assert!(matches!(err, Error::Interpolation(_)));
        assert_eq!(env.get("VCAP_SERVICES"), Some(REF_DOC));
    }

    #[test]
    fn test_response_error_status() {
        let url = Url::parse("https://credhub.internal:8844/api/v1/interpolate").unwrap();
        let err = interpolated_document(&url, StatusCode::FORBIDDEN, "  permission denied\n").unwrap_err();

        assert_eq!(err.exit_code(), crate::error::EXIT_INTERPOLATION);
        let message = err.to_string();
        assert!(message.contains("403"), "{}", message);
        assert!(message.contains("permission denied"), "{}", message);
    }

    #[test]
    fn test_response_body_must_be_object() {
        let url = Url::parse("https://credhub.internal:8844/api/v1/interpolate").unwrap();

        let err = interpolated_document(&url, StatusCode::OK, "[1,2]").unwrap_err();
        assert!(err.to_string().contains("not a JSON object"));

        let err = interpolated_document(&url, StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, Error::Interpolation(_)));
    }

    #[test]
    fn test_response_object_is_reserialized() {
        let url = Url::parse("https://credhub.internal:8844/api/v1/interpolate").unwrap();
        let body = r#"{ "p-mysql": [ { "credentials": { "password": "s3cret" } } ] }"#;

        let doc = interpolated_document(&url, StatusCode::OK, body).unwrap();
        assert_eq!(doc, r#"{"p-mysql":[{"credentials":{"password":"s3cret"}}]}"#);
    }

    #[test]
    fn test_interpolate_url_joins_path() {
        let client = CredHubClient::new(CredHubConfig::default());
        let url = client.interpolate_url(&endpoint()).unwrap();
        assert_eq!(url.as_str(), "https://credhub.service.internal:8844/api/v1/interpolate");
    }

    #[tokio::test]
    async fn test_client_reports_missing_certificate_files() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ClientIdentity {
            cert_path: dir.path().join("instance.crt"),
            key_path: dir.path().join("instance.key"),
            trust_roots: dir.path().to_path_buf(),
        };

        let client = CredHubClient::new(CredHubConfig::default());
        let err = client.interpolate(&endpoint(), &identity, REF_DOC).await.unwrap_err();
        assert!(matches!(err, Error::MissingCredentialMaterial(_)));
    }

    #[tokio::test]
    async fn test_empty_trust_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_trust_roots(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("no trust roots"));
    }
}
