//! The `api` adaptor: items are selected from a JSON response with a JSONPath expression.

use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use serde_json_path::JsonPath;
use snafu::{OptionExt, ResultExt, ensure};

use super::{
    DecodeBodySnafu, InvalidHeaderSnafu, InvalidJsonPathSnafu, Result, SendRequestSnafu,
    UnexpectedStatusSnafu, resolve_utf8_secret,
};
use crate::{
    crd::list_source::{ApiAuthType, ApiSourceSpec},
    secret::SecretResolver,
};

/// Selects every element of a top level array
pub const DEFAULT_JSON_PATH: &str = "$[*]";

pub(super) async fn resolve(
    http: &reqwest::Client,
    config: &ApiSourceSpec,
    namespace: &str,
    secrets: &dyn SecretResolver,
) -> Result<Vec<String>> {
    // Parsed up front, so that an invalid expression fails without touching the network
    let path_expression = config.json_path.as_deref().unwrap_or(DEFAULT_JSON_PATH);
    let path = JsonPath::parse(path_expression).context(InvalidJsonPathSnafu {
        path: path_expression,
    })?;

    let url = config.url.as_str();
    let mut request = http.get(url);
    for (name, value) in &config.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).ok().context(InvalidHeaderSnafu { name })?;
        let header_value = HeaderValue::from_str(value)
            .ok()
            .context(InvalidHeaderSnafu { name })?;
        request = request.header(header_name, header_value);
    }

    if let Some(auth) = &config.auth {
        match auth.auth_type {
            ApiAuthType::Basic => {
                let username =
                    resolve_utf8_secret(secrets, namespace, &auth.secret_ref, auth.username_key())
                        .await?;
                let password =
                    resolve_utf8_secret(secrets, namespace, &auth.secret_ref, auth.password_key())
                        .await?;
                request = request.basic_auth(username, Some(password));
            }
            ApiAuthType::Bearer => {
                tracing::debug!("bearer tokens are only sent when configured as Authorization header");
            }
        }
    }

    let response = request.send().await.context(SendRequestSnafu { url })?;
    let status = response.status();
    ensure!(
        status.is_success(),
        UnexpectedStatusSnafu {
            status: status.as_u16(),
            url,
        }
    );
    let body: Value = response.json().await.context(DecodeBodySnafu { url })?;

    let items = extract_items(&path, &body);
    tracing::debug!(url, item.count = items.len(), "resolved items from API");
    Ok(items)
}

/// Evaluates `path` against `body`, turning every match into an item.
///
/// Strings are taken verbatim, other values as their JSON text. `null` matches are skipped.
pub fn extract_items(path: &JsonPath, body: &Value) -> Vec<String> {
    path.query(body)
        .all()
        .into_iter()
        .filter_map(|value| match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        ErrorKind,
        crd::list_source::{ApiAuthSpec, SecretRef},
        source::Error,
        test_utils::{StaticSecrets, serve_http},
    };

    fn http() -> reqwest::Client {
        reqwest::Client::new()
    }

    fn config(url: String, json_path: Option<&str>) -> ApiSourceSpec {
        ApiSourceSpec {
            url,
            json_path: json_path.map(ToString::to_string),
            ..ApiSourceSpec::default()
        }
    }

    #[rstest]
    #[case(json!(["x", "y"]), "$[*]", &["x", "y"])]
    #[case(json!({"users": [{"name": "ann"}, {"name": "bob"}]}), "$.users[*].name", &["ann", "bob"])]
    #[case(json!([1, 2.5, true, {"a": 1}, null, "s"]), "$[*]", &["1", "2.5", "true", r#"{"a":1}"#, "s"])]
    #[case(json!({"users": []}), "$.users[*]", &[])]
    #[case(json!({"users": []}), "$.missing[*]", &[])]
    fn extract(#[case] body: Value, #[case] path: &str, #[case] expected: &[&str]) {
        let path = JsonPath::parse(path).expect("valid path");
        assert_eq!(extract_items(&path, &body), expected);
    }

    #[tokio::test]
    async fn default_path_selects_top_level_array() {
        let url = serve_http(Router::new().route("/items", get(|| async { Json(json!(["x", "y"])) })))
            .await;

        let items = resolve(&http(), &config(format!("{url}/items"), None), "default", &StaticSecrets::default())
            .await
            .expect("items resolve");
        assert_eq!(items, ["x", "y"]);
    }

    #[tokio::test]
    async fn error_status_fails_fetch() {
        let url = serve_http(Router::new().route(
            "/items",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;

        let err = resolve(&http(), &config(format!("{url}/items"), None), "default", &StaticSecrets::default())
            .await
            .expect_err("500 is an error");
        assert_eq!(err.to_string(), "API request failed with status 500");
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
    }

    #[tokio::test]
    async fn malformed_body_fails_fetch() {
        let url = serve_http(Router::new().route("/items", get(|| async { "not json" }))).await;

        let err = resolve(&http(), &config(format!("{url}/items"), None), "default", &StaticSecrets::default())
            .await
            .expect_err("body is not JSON");
        assert!(matches!(err, Error::DecodeBody { .. }));
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
    }

    #[tokio::test]
    async fn invalid_path_fails_before_request() {
        // Nothing listens on port 1, reaching the network would fail differently
        let config = config("http://127.0.0.1:1/items".to_string(), Some("$.invalid.[*"));

        let err = resolve(&http(), &config, "default", &StaticSecrets::default())
            .await
            .expect_err("path is invalid");
        assert!(err.to_string().starts_with("failed to parse JSONPath expression"));
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_fetch() {
        let config = config("http://127.0.0.1:1/items".to_string(), None);

        let err = resolve(&http(), &config, "default", &StaticSecrets::default())
            .await
            .expect_err("nothing listens");
        assert!(matches!(err, Error::SendRequest { .. }));
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
    }

    async fn echo_authorization(headers: HeaderMap) -> Json<Value> {
        let value = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(json!([value]))
    }

    #[tokio::test]
    async fn basic_auth_from_secret() {
        let url = serve_http(Router::new().route("/items", get(echo_authorization))).await;
        let secrets = StaticSecrets::default()
            .with("default", "creds", "user", "user")
            .with("default", "creds", "pass", "s3cret");
        let config = ApiSourceSpec {
            auth: Some(ApiAuthSpec {
                auth_type: ApiAuthType::Basic,
                secret_ref: SecretRef {
                    name: "creds".to_string(),
                    ..SecretRef::default()
                },
                username_key: Some("user".to_string()),
                password_key: Some("pass".to_string()),
            }),
            ..config(format!("{url}/items"), None)
        };

        let items = resolve(&http(), &config, "default", &secrets)
            .await
            .expect("items resolve");
        assert_eq!(items, ["Basic dXNlcjpzM2NyZXQ="]);
    }

    #[tokio::test]
    async fn missing_credentials_are_not_ready() {
        let config = ApiSourceSpec {
            auth: Some(ApiAuthSpec {
                secret_ref: SecretRef {
                    name: "creds".to_string(),
                    ..SecretRef::default()
                },
                ..ApiAuthSpec::default()
            }),
            ..config("http://127.0.0.1:1/items".to_string(), None)
        };

        let err = resolve(&http(), &config, "default", &StaticSecrets::default())
            .await
            .expect_err("secret is missing");
        assert_eq!(err.kind(), ErrorKind::DependencyNotReady);
    }

    #[tokio::test]
    async fn bearer_token_travels_in_headers() {
        let url = serve_http(Router::new().route("/items", get(echo_authorization))).await;
        let config = ApiSourceSpec {
            headers: [("Authorization".to_string(), "Bearer t0ken".to_string())].into(),
            auth: Some(ApiAuthSpec {
                auth_type: ApiAuthType::Bearer,
                ..ApiAuthSpec::default()
            }),
            ..config(format!("{url}/items"), None)
        };

        let items = resolve(&http(), &config, "default", &StaticSecrets::default())
            .await
            .expect("items resolve");
        assert_eq!(items, ["Bearer t0ken"]);
    }

    #[tokio::test]
    async fn invalid_header_is_config_error() {
        let config = ApiSourceSpec {
            headers: [("bad header".to_string(), "x".to_string())].into(),
            ..config("http://127.0.0.1:1/items".to_string(), None)
        };

        let err = resolve(&http(), &config, "default", &StaticSecrets::default())
            .await
            .expect_err("header name is invalid");
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
