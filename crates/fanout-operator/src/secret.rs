//! Reads credentials referenced by list sources out of Kubernetes Secrets.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{ErrorKind, client::Client, crd::list_source::SecretRef};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("secret {namespace}/{name} not found"))]
    SecretNotFound { namespace: String, name: String },

    #[snafu(display("key {key:?} not found in secret {namespace}/{name}"))]
    KeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[snafu(display("failed to read secret {namespace}/{name}"))]
    ReadSecret {
        source: crate::client::Error,
        namespace: String,
        name: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SecretNotFound { .. } | Self::KeyNotFound { .. } => ErrorKind::DependencyNotReady,
            Self::ReadSecret { .. } => ErrorKind::FetchFailed,
        }
    }
}

/// Resolves a key of a referenced Secret to its decoded bytes.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Returns the value of `key` in the Secret `secret` refers to.
    ///
    /// Secrets without an explicit namespace are looked up in `default_namespace`.
    async fn resolve(
        &self,
        default_namespace: &str,
        secret: &SecretRef,
        key: &str,
    ) -> Result<Vec<u8>, Error>;
}

/// [`SecretResolver`] reading Secrets from the API server.
#[derive(Clone)]
pub struct KubeSecretResolver {
    client: Client,
}

impl KubeSecretResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretResolver for KubeSecretResolver {
    async fn resolve(
        &self,
        default_namespace: &str,
        secret: &SecretRef,
        key: &str,
    ) -> Result<Vec<u8>, Error> {
        let namespace = secret.namespace.as_deref().unwrap_or(default_namespace);
        let name = secret.name.as_str();
        let found = self
            .client
            .get_opt::<Secret>(name, namespace)
            .await
            .context(ReadSecretSnafu { namespace, name })?
            .context(SecretNotFoundSnafu { namespace, name })?;

        // The API server only ever returns `data`, `stringData` is write-only
        found
            .data
            .and_then(|mut data| data.remove(key))
            .map(|value| value.0)
            .context(KeyNotFoundSnafu {
                namespace,
                name,
                key,
            })
    }
}
