//! Adaptors resolving the items of a [`ListSource`](crate::crd::list_source::ListSource).
//!
//! [`SourceConfig::from_spec`] validates a spec into exactly one adaptor configuration,
//! [`SourceResolver::resolve`] runs it. Resolution yields items in upstream order.

use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{
    ErrorKind,
    crd::list_source::{ApiSourceSpec, ListSourceSpec, SourceType, SqlSourceSpec},
    secret::SecretResolver,
};

pub mod api;
pub mod sql;
pub mod static_list;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid list source configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("failed to parse JSONPath expression {path:?}"))]
    InvalidJsonPath {
        source: serde_json_path::ParseError,
        path: String,
    },

    #[snafu(display("invalid request header {name:?}"))]
    InvalidHeader { name: String },

    #[snafu(display("secret value for key {key:?} is not valid UTF-8"))]
    NonUtf8Secret {
        source: std::string::FromUtf8Error,
        key: String,
    },

    #[snafu(display("failed to resolve credentials"))]
    ResolveSecret { source: crate::secret::Error },

    #[snafu(display("failed to build HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("failed to request {url}"))]
    SendRequest { source: reqwest::Error, url: String },

    #[snafu(display("API request failed with status {status}"))]
    UnexpectedStatus { status: u16, url: String },

    #[snafu(display("response body of {url} is not valid JSON"))]
    DecodeBody { source: reqwest::Error, url: String },

    #[snafu(display("invalid connection string: {reason}"))]
    InvalidConnectionString { reason: String },

    #[snafu(display("failed to parse connection options"))]
    ParseConnectOptions { source: sqlx::Error },

    #[snafu(display("timed out after {timeout:?} connecting to the database"))]
    ConnectTimeout { timeout: Duration },

    #[snafu(display("failed to connect to the database"))]
    Connect { source: sqlx::Error },

    #[snafu(display("failed to run query"))]
    Query { source: sqlx::Error },

    #[snafu(display("failed to read the first column of row {row}"))]
    DecodeColumn { source: sqlx::Error, row: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. }
            | Self::InvalidJsonPath { .. }
            | Self::InvalidHeader { .. }
            | Self::NonUtf8Secret { .. }
            | Self::InvalidConnectionString { .. }
            | Self::ParseConnectOptions { .. } => ErrorKind::ConfigInvalid,
            Self::ResolveSecret { source } => source.kind(),
            Self::BuildHttpClient { .. }
            | Self::SendRequest { .. }
            | Self::UnexpectedStatus { .. }
            | Self::DecodeBody { .. }
            | Self::ConnectTimeout { .. }
            | Self::Connect { .. }
            | Self::Query { .. }
            | Self::DecodeColumn { .. } => ErrorKind::FetchFailed,
        }
    }
}

/// The single adaptor configuration a [`ListSourceSpec`] selects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceConfig<'a> {
    Static(&'a [String]),
    Api(&'a ApiSourceSpec),
    Sql(&'a SqlSourceSpec),
}

impl<'a> SourceConfig<'a> {
    /// Validates that exactly the configuration block matching `type` is present.
    pub fn from_spec(spec: &'a ListSourceSpec) -> Result<Self> {
        ensure!(
            spec.interval_seconds >= 1,
            InvalidConfigSnafu {
                reason: format!(
                    "intervalSeconds must be at least 1, got {}",
                    spec.interval_seconds
                ),
            }
        );

        let configured: Vec<&str> = [
            spec.static_list.as_ref().map(|_| "staticList"),
            spec.api.as_ref().map(|_| "api"),
            spec.sql.as_ref().map(|_| "sql"),
        ]
        .into_iter()
        .flatten()
        .collect();
        let expected = match spec.source_type {
            SourceType::Static => "staticList",
            SourceType::Api => "api",
            SourceType::Sql => "sql",
        };
        if let Some(extra) = configured.iter().find(|block| **block != expected) {
            return InvalidConfigSnafu {
                reason: format!(
                    "{extra} must not be set for a source of type {}",
                    spec.source_type
                ),
            }
            .fail();
        }

        let missing = || InvalidConfigSnafu {
            reason: format!(
                "{expected} must be set for a source of type {}",
                spec.source_type
            ),
        };
        let config = match spec.source_type {
            SourceType::Static => Self::Static(spec.static_list.as_deref().with_context(missing)?),
            SourceType::Api => {
                let api = spec.api.as_ref().with_context(missing)?;
                ensure!(
                    !api.url.trim().is_empty(),
                    InvalidConfigSnafu {
                        reason: "api.url must not be empty"
                    }
                );
                Self::Api(api)
            }
            SourceType::Sql => {
                let sql = spec.sql.as_ref().with_context(missing)?;
                ensure!(
                    !sql.connection_string.trim().is_empty(),
                    InvalidConfigSnafu {
                        reason: "sql.connectionString must not be empty"
                    }
                );
                ensure!(
                    !sql.query.trim().is_empty(),
                    InvalidConfigSnafu {
                        reason: "sql.query must not be empty"
                    }
                );
                Self::Sql(sql)
            }
        };
        Ok(config)
    }
}

/// Runs source adaptors. Shared by all reconciliations, it pools HTTP connections.
#[derive(Clone, Debug)]
pub struct SourceResolver {
    http: reqwest::Client,
    sql_connect_timeout: Duration,
}

impl SourceResolver {
    pub fn new(http_timeout: Duration, sql_connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent(concat!("fanout-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(BuildHttpClientSnafu)?;
        Ok(Self {
            http,
            sql_connect_timeout,
        })
    }

    /// Resolves the items of `config`. Credentials are looked up relative to `namespace`.
    #[tracing::instrument(skip(self, config, secrets))]
    pub async fn resolve(
        &self,
        config: SourceConfig<'_>,
        namespace: &str,
        secrets: &dyn SecretResolver,
    ) -> Result<Vec<String>> {
        match config {
            SourceConfig::Static(items) => Ok(static_list::resolve(items)),
            SourceConfig::Api(api) => api::resolve(&self.http, api, namespace, secrets).await,
            SourceConfig::Sql(sql) => {
                sql::resolve(sql, namespace, secrets, self.sql_connect_timeout).await
            }
        }
    }
}

/// Reads a credential and requires it to be valid UTF-8.
pub(crate) async fn resolve_utf8_secret(
    secrets: &dyn SecretResolver,
    namespace: &str,
    secret: &crate::crd::list_source::SecretRef,
    key: &str,
) -> Result<String> {
    let bytes = secrets
        .resolve(namespace, secret, key)
        .await
        .context(ResolveSecretSnafu)?;
    String::from_utf8(bytes).context(NonUtf8SecretSnafu { key })
}
