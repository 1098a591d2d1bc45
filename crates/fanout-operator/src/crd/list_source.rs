use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

pub const DEFAULT_INTERVAL_SECONDS: i64 = 60;

/// Resolves a list of items from a static list, an HTTP API or a SQL query and
/// publishes them to an item ledger ConfigMap of the same name.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "batchops.io",
    version = "v1alpha1",
    kind = "ListSource",
    namespaced,
    status = "ListSourceStatus",
    shortname = "ls",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Items","type":"integer","jsonPath":".status.resolvedItemCount"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.lastError","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ListSourceSpec {
    /// Which of `staticList`, `api` and `sql` the items are resolved from.
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Items of a `static` source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_list: Option<Vec<String>>,

    /// Settings of an `api` source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSourceSpec>,

    /// Settings of a `sql` source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<SqlSourceSpec>,

    /// Seconds between two resolutions.
    #[serde(default = "ListSourceSpec::default_interval_seconds")]
    pub interval_seconds: i64,
}

impl ListSourceSpec {
    const fn default_interval_seconds() -> i64 {
        DEFAULT_INTERVAL_SECONDS
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceType {
    #[default]
    Static,
    Api,
    Sql,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSourceSpec {
    /// URL the items are fetched from with a `GET` request.
    pub url: String,

    /// Extra request headers, e.g. an `Authorization` header for bearer tokens.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// JSONPath selecting the items in the response body. Defaults to `$[*]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ApiAuthSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAuthSpec {
    #[serde(rename = "type")]
    pub auth_type: ApiAuthType,

    /// Secret holding the credentials.
    pub secret_ref: SecretRef,

    /// Key of the username in the Secret, `username` if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_key: Option<String>,

    /// Key of the password in the Secret, `password` if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key: Option<String>,
}

impl ApiAuthSpec {
    pub fn username_key(&self) -> &str {
        self.username_key.as_deref().unwrap_or("username")
    }

    pub fn password_key(&self) -> &str {
        self.password_key.as_deref().unwrap_or("password")
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiAuthType {
    /// HTTP basic authentication with a username and a password from the Secret.
    #[default]
    Basic,
    /// Bearer token authentication. The token must be passed with an `Authorization` header.
    Bearer,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlSourceSpec {
    /// A PostgreSQL connection URL (`postgres://user@host/db`) or `key=value` connection string.
    pub connection_string: String,

    /// Query whose first column of every row becomes an item.
    pub query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SqlAuthSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlAuthSpec {
    /// Secret holding the database password.
    pub secret_ref: SecretRef,

    /// Key of the password in the Secret. Falls back to `secretRef.key`, then `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key: Option<String>,
}

impl SqlAuthSpec {
    pub fn password_key(&self) -> &str {
        self.password_key
            .as_deref()
            .or(self.secret_ref.key.as_deref())
            .unwrap_or("password")
    }
}

/// Reference to a Secret, by default in the namespace of the referencing object.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

// Every field is written on each status patch, `None` clears the field.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSourceStatus {
    /// Number of items published by the last successful resolution.
    #[serde(default)]
    pub resolved_item_count: i64,

    /// When the items were last resolved successfully.
    pub last_resolution_time: Option<Time>,

    /// Error of the last resolution, empty if it succeeded.
    pub last_error: Option<String>,

    /// Generation of the spec the last resolution ran against.
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn deserialize_api_source() {
        let spec: ListSourceSpec = serde_yaml::from_str(indoc! {r#"
            type: api
            api:
              url: https://example.com/users
              jsonPath: "$.users[*].name"
              headers:
                Accept: application/json
              auth:
                type: basic
                secretRef:
                  name: api-credentials
        "#})
        .expect("valid spec");

        assert_eq!(spec.source_type, SourceType::Api);
        assert_eq!(spec.interval_seconds, DEFAULT_INTERVAL_SECONDS);
        let api = spec.api.expect("api is set");
        assert_eq!(api.json_path.as_deref(), Some("$.users[*].name"));
        let auth = api.auth.expect("auth is set");
        assert_eq!(auth.username_key(), "username");
        assert_eq!(auth.password_key(), "password");
    }

    #[test]
    fn sql_password_key_fallbacks() {
        let mut auth = SqlAuthSpec {
            secret_ref: SecretRef {
                name: "db".to_string(),
                ..SecretRef::default()
            },
            password_key: None,
        };
        assert_eq!(auth.password_key(), "password");

        auth.secret_ref.key = Some("pw".to_string());
        assert_eq!(auth.password_key(), "pw");

        auth.password_key = Some("db-password".to_string());
        assert_eq!(auth.password_key(), "db-password");
    }

    #[test]
    fn source_type_display_matches_serialization() {
        assert_eq!(SourceType::Sql.to_string(), "sql");
        assert_eq!(
            serde_json::to_string(&SourceType::Sql).expect("serializable"),
            r#""sql""#
        );
    }
}
