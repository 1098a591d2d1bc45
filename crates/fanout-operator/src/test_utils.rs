//! Test doubles for the Kubernetes API server, Secrets and HTTP endpoints.

use std::{
    collections::BTreeMap,
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header::CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use kube::Resource;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{crd::list_source::SecretRef, secret, secret::SecretResolver};

/// Collection path (`/api/v1/namespaces/default/configmaps`) to objects by name
type Collections = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
struct State {
    collections: Collections,
    next_resource_version: u64,
    next_uid: u64,
}

impl State {
    fn bump(&mut self, object: &mut Value) {
        self.next_resource_version += 1;
        object["metadata"]["resourceVersion"] = json!(self.next_resource_version.to_string());
    }
}

/// An in-memory API server good enough for reconcilers.
///
/// It keeps objects as JSON per collection and implements get, list (with equality label
/// selectors), create, replace, merge and apply patches, delete and the status subresource.
/// Writes carrying a stale `resourceVersion` fail with 409. Deleting an object with
/// finalizers only sets its deletion timestamp, the object goes away once the last
/// finalizer is removed.
#[derive(Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<State>>,
}

impl FakeApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake API server state is not poisoned")
    }

    /// A client talking to this server. Must be called within a Tokio runtime.
    pub fn client(&self) -> kube::Client {
        let state = self.state.clone();
        let service = tower::service_fn(move |request: Request<kube::client::Body>| {
            let state = state.clone();
            async move {
                let (parts, body) = request.into_parts();
                let body = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Bytes::new(),
                };
                let mut state = state.lock().expect("fake API server state is not poisoned");
                Ok::<_, Infallible>(handle(&mut state, &parts, &body))
            }
        });
        kube::Client::new(service, "default")
    }

    /// Stores `object` as if it had been created through the API, returning the stored copy.
    pub fn insert<K>(&self, object: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let path = collection_path::<K>(object.meta().namespace.as_deref().unwrap_or("default"));
        let mut value = serde_json::to_value(object).expect("object serializes");
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        let mut state = self.state();
        create(&mut state, &path, value, false);
        let name = object.meta().name.clone().unwrap_or_default();
        let stored = state.collections[&path][&name].clone();
        serde_json::from_value(stored).expect("stored object deserializes")
    }

    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let path = collection_path::<K>(namespace);
        self.state()
            .collections
            .get(&path)
            .and_then(|objects| objects.get(name))
            .map(|value| serde_json::from_value(value.clone()).expect("stored object deserializes"))
    }

    pub fn list<K>(&self, namespace: &str) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let path = collection_path::<K>(namespace);
        self.state()
            .collections
            .get(&path)
            .map(|objects| {
                objects
                    .values()
                    .map(|value| {
                        serde_json::from_value(value.clone()).expect("stored object deserializes")
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn collection_path<K: Resource<DynamicType = ()>>(namespace: &str) -> String {
    let group = K::group(&());
    let version = K::version(&());
    let plural = K::plural(&());
    if group.is_empty() {
        format!("/api/{version}/namespaces/{namespace}/{plural}")
    } else {
        format!("/apis/{group}/{version}/namespaces/{namespace}/{plural}")
    }
}

/// Splits a request path into collection path, object name and subresource.
fn route(path: &str) -> Option<(String, Option<String>, Option<String>)> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let namespaces = segments.iter().position(|s| *s == "namespaces")?;
    let collection_end = namespaces + 3;
    if segments.len() < collection_end {
        return None;
    }
    let collection = format!("/{}", segments[..collection_end].join("/"));
    let name = segments.get(collection_end).map(ToString::to_string);
    let subresource = segments.get(collection_end + 1).map(ToString::to_string);
    Some((collection, name, subresource))
}

fn respond(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    response
}

fn status(code: StatusCode, reason: &str, message: &str) -> Response<Full<Bytes>> {
    respond(
        code,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code.as_u16(),
        }),
    )
}

fn not_found(name: &str) -> Response<Full<Bytes>> {
    status(StatusCode::NOT_FOUND, "NotFound", &format!("{name:?} not found"))
}

fn conflict(name: &str) -> Response<Full<Bytes>> {
    status(
        StatusCode::CONFLICT,
        "Conflict",
        &format!("the object {name:?} has been modified"),
    )
}

fn handle(state: &mut State, parts: &http::request::Parts, body: &[u8]) -> Response<Full<Bytes>> {
    let Some((collection, name, subresource)) = route(parts.uri.path()) else {
        return not_found(parts.uri.path());
    };
    let body: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => return status(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string()),
        }
    };
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match (&parts.method, name) {
        (&Method::GET, None) => list(state, &collection, parts.uri.query()),
        (&Method::GET, Some(name)) => match state.collections.get(&collection).and_then(|c| c.get(&name)) {
            Some(object) => respond(StatusCode::OK, object),
            None => not_found(&name),
        },
        (&Method::POST, None) => create(state, &collection, body, true),
        (&Method::PUT, Some(name)) => replace(state, &collection, &name, body, subresource.is_some()),
        (&Method::PATCH, Some(name)) => patch(
            state,
            &collection,
            &name,
            &body,
            content_type,
            subresource.is_some(),
        ),
        (&Method::DELETE, Some(name)) => delete(state, &collection, &name),
        _ => status(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            "unsupported request",
        ),
    }
}

fn matches_selector(object: &Value, query: Option<&str>) -> bool {
    let Some(selector) = query.and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "labelSelector")
            .map(|(_, value)| value.into_owned())
    }) else {
        return true;
    };
    selector
        .split(',')
        .filter(|requirement| !requirement.is_empty())
        .all(|requirement| match requirement.split_once('=') {
            Some((key, value)) => object["metadata"]["labels"][key] == json!(value),
            None => false,
        })
}

fn list(state: &State, collection: &str, query: Option<&str>) -> Response<Full<Bytes>> {
    let items: Vec<&Value> = state
        .collections
        .get(collection)
        .map(|objects| {
            objects
                .values()
                .filter(|object| matches_selector(object, query))
                .collect()
        })
        .unwrap_or_default();
    respond(
        StatusCode::OK,
        &json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": { "resourceVersion": state.next_resource_version.to_string() },
            "items": items,
        }),
    )
}

fn create(state: &mut State, collection: &str, mut object: Value, via_api: bool) -> Response<Full<Bytes>> {
    let Some(name) = object["metadata"]["name"].as_str().map(ToString::to_string) else {
        return status(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", "name is required");
    };
    if state
        .collections
        .get(collection)
        .is_some_and(|objects| objects.contains_key(&name))
    {
        return status(
            StatusCode::CONFLICT,
            "AlreadyExists",
            &format!("{name:?} already exists"),
        );
    }

    state.next_uid += 1;
    let metadata = &mut object["metadata"];
    metadata["uid"] = json!(format!("uid-{}", state.next_uid));
    if metadata["creationTimestamp"].is_null() {
        metadata["creationTimestamp"] = json!(jiff::Timestamp::now().to_string());
    }
    if metadata["generation"].is_null() {
        metadata["generation"] = json!(1);
    }
    if via_api {
        metadata["deletionTimestamp"] = Value::Null;
    }
    if let Some(namespace) = collection.split('/').skip_while(|s| *s != "namespaces").nth(1) {
        metadata["namespace"] = json!(namespace);
    }
    state.bump(&mut object);
    state
        .collections
        .entry(collection.to_string())
        .or_default()
        .insert(name, object.clone());
    respond(StatusCode::CREATED, &object)
}

/// Persists `object`, completing a pending deletion once no finalizers are left.
fn store(state: &mut State, collection: &str, name: &str, mut object: Value) -> Response<Full<Bytes>> {
    state.bump(&mut object);
    let released = !object["metadata"]["deletionTimestamp"].is_null()
        && object["metadata"]["finalizers"]
            .as_array()
            .is_none_or(Vec::is_empty);
    let objects = state.collections.entry(collection.to_string()).or_default();
    if released {
        objects.remove(name);
    } else {
        objects.insert(name.to_string(), object.clone());
    }
    respond(StatusCode::OK, &object)
}

fn is_stale(live: &Value, update: &Value) -> bool {
    match update["metadata"]["resourceVersion"].as_str() {
        Some(version) => live["metadata"]["resourceVersion"].as_str() != Some(version),
        None => false,
    }
}

fn replace(
    state: &mut State,
    collection: &str,
    name: &str,
    mut update: Value,
    status_only: bool,
) -> Response<Full<Bytes>> {
    let Some(live) = state.collections.get(collection).and_then(|c| c.get(name)).cloned() else {
        return not_found(name);
    };
    if is_stale(&live, &update) {
        return conflict(name);
    }
    let object = if status_only {
        let mut object = live;
        object["status"] = update["status"].take();
        object
    } else {
        // Server managed fields and the status survive a replace of the main resource
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            update["metadata"][field] = live["metadata"][field].clone();
        }
        if !live["status"].is_null() {
            update["status"] = live["status"].clone();
        }
        update
    };
    store(state, collection, name, object)
}

fn patch(
    state: &mut State,
    collection: &str,
    name: &str,
    patch: &Value,
    content_type: &str,
    status_only: bool,
) -> Response<Full<Bytes>> {
    let live = state.collections.get(collection).and_then(|c| c.get(name)).cloned();
    let mut object = match live {
        Some(live) => live,
        None if content_type.starts_with("application/apply-patch") => {
            return create(state, collection, patch.clone(), true);
        }
        None => return not_found(name),
    };
    if is_stale(&object, patch) {
        return conflict(name);
    }
    if content_type.starts_with("application/json-patch") {
        let operations: json_patch::Patch = match serde_json::from_value(patch.clone()) {
            Ok(operations) => operations,
            Err(err) => return status(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string()),
        };
        if let Err(err) = json_patch::patch(&mut object, &operations) {
            return status(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", &err.to_string());
        }
    } else if status_only {
        json_patch::merge(&mut object["status"], &patch["status"]);
    } else {
        let mut patch = patch.clone();
        if let Some(patch) = patch.as_object_mut() {
            patch.remove("status");
        }
        json_patch::merge(&mut object, &patch);
    }
    store(state, collection, name, object)
}

fn delete(state: &mut State, collection: &str, name: &str) -> Response<Full<Bytes>> {
    let Some(mut object) = state.collections.get(collection).and_then(|c| c.get(name)).cloned() else {
        return not_found(name);
    };
    let has_finalizers = object["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|finalizers| !finalizers.is_empty());
    if has_finalizers {
        if object["metadata"]["deletionTimestamp"].is_null() {
            object["metadata"]["deletionTimestamp"] = json!(jiff::Timestamp::now().to_string());
        }
        store(state, collection, name, object)
    } else {
        if let Some(objects) = state.collections.get_mut(collection) {
            objects.remove(name);
        }
        respond(StatusCode::OK, &object)
    }
}

/// A [`SecretResolver`] serving fixed values.
#[derive(Clone, Default)]
pub struct StaticSecrets {
    values: BTreeMap<(String, String, String), Vec<u8>>,
}

impl StaticSecrets {
    pub fn with(mut self, namespace: &str, name: &str, key: &str, value: &str) -> Self {
        self.values.insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.as_bytes().to_vec(),
        );
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve(
        &self,
        default_namespace: &str,
        secret: &SecretRef,
        key: &str,
    ) -> Result<Vec<u8>, secret::Error> {
        let namespace = secret.namespace.as_deref().unwrap_or(default_namespace);
        self.values
            .get(&(namespace.to_string(), secret.name.clone(), key.to_string()))
            .cloned()
            .ok_or_else(|| secret::Error::SecretNotFound {
                namespace: namespace.to_string(),
                name: secret.name.clone(),
            })
    }
}

/// Serves `router` on an ephemeral local port, returning its base URL.
pub async fn serve_http(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port can be bound");
    let address = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("test HTTP server runs");
    });
    format!("http://{address}")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        "/api/v1/namespaces/default/configmaps",
        Some(("/api/v1/namespaces/default/configmaps", None, None))
    )]
    #[case(
        "/apis/batchops.io/v1alpha1/namespaces/ns/fanoutjobs/job/status",
        Some(("/apis/batchops.io/v1alpha1/namespaces/ns/fanoutjobs", Some("job"), Some("status")))
    )]
    #[case("/apis/batchops.io/v1alpha1/fanoutjobs", None)]
    fn routes(
        #[case] path: &str,
        #[case] expected: Option<(&str, Option<&str>, Option<&str>)>,
    ) {
        let expected = expected.map(|(collection, name, subresource)| {
            (
                collection.to_string(),
                name.map(ToString::to_string),
                subresource.map(ToString::to_string),
            )
        });
        assert_eq!(route(path), expected);
    }
}
