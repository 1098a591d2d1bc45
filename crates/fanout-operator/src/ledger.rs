//! The item ledger: a ConfigMap per ListSource holding the items it last resolved.
//!
//! The ledger has the same name and namespace as its ListSource and stores the items
//! comma separated under [`ITEMS_KEY`]. It is owned by the ListSource and therefore
//! garbage collected with it. Fan-out objects only ever read it.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::{
    ErrorKind,
    builder::{self, configmap::ConfigMapBuilder, meta::ObjectMetaBuilder},
    client::Client,
    crd::list_source::ListSource,
    labels::ITEM_LEDGER_COMPONENT,
};

/// Data key holding the encoded items, shared by the ledger and rendered item lists
pub const ITEMS_KEY: &str = "items";

const SEPARATOR: char = ',';

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build ledger ConfigMap"))]
    BuildLedger { source: builder::Error },

    #[snafu(display("failed to read ledger {namespace}/{name}"))]
    ReadLedger {
        source: crate::client::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to write ledger {namespace}/{name}"))]
    WriteLedger {
        source: crate::client::Error,
        namespace: String,
        name: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BuildLedger { .. } => ErrorKind::ConfigInvalid,
            Self::ReadLedger { source, .. } | Self::WriteLedger { source, .. } => source.kind(),
        }
    }
}

/// Joins `items` with commas.
///
/// Items containing a comma cannot be told apart from two items once decoded.
pub fn encode_items(items: &[String]) -> String {
    items.join(&SEPARATOR.to_string())
}

/// Splits an encoded ledger value. The empty string decodes to no items.
pub fn decode_items(encoded: &str) -> Vec<String> {
    if encoded.is_empty() {
        Vec::new()
    } else {
        encoded.split(SEPARATOR).map(str::to_string).collect()
    }
}

/// Reads the items stored in a ledger ConfigMap, [`None`] if it has no items key.
pub fn ledger_items(ledger: &ConfigMap) -> Option<Vec<String>> {
    ledger
        .data
        .as_ref()
        .and_then(|data| data.get(ITEMS_KEY))
        .map(|encoded| decode_items(encoded))
}

/// Keyed store of published items, backed by ConfigMaps.
#[derive(Clone)]
pub struct ItemLedger {
    client: Client,
}

impl ItemLedger {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns the items published under `name`, [`None`] if nothing has been published yet.
    pub async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<String>>, Error> {
        let ledger = self
            .client
            .get_opt::<ConfigMap>(name, namespace)
            .await
            .context(ReadLedgerSnafu { namespace, name })?;
        Ok(ledger.as_ref().and_then(ledger_items))
    }

    /// Publishes `items` as the current items of `source`.
    ///
    /// The whole ledger is overwritten. Publishing unchanged items does not write at all,
    /// so the ledger keeps its resource version and dependents are not woken up.
    pub async fn publish(&self, source: &ListSource, items: &[String]) -> Result<ConfigMap, Error> {
        let name = source.name_any();
        let namespace = source.namespace().unwrap_or_default();
        let desired = ConfigMapBuilder::new()
            .metadata(
                ObjectMetaBuilder::new()
                    .name_and_namespace(source)
                    .ownerreference_from_resource(source)
                    .context(BuildLedgerSnafu)?
                    .with_recommended_labels(&name, ITEM_LEDGER_COMPONENT)
                    .build(),
            )
            .add_data(ITEMS_KEY, encode_items(items))
            .build()
            .context(BuildLedgerSnafu)?;

        let write_context = || WriteLedgerSnafu {
            namespace: &namespace,
            name: &name,
        };
        let existing = self
            .client
            .get_opt::<ConfigMap>(&name, &namespace)
            .await
            .context(ReadLedgerSnafu {
                namespace: &namespace,
                name: &name,
            })?;
        match existing {
            None => self.client.create(&desired).await.with_context(|_| write_context()),
            Some(existing) if existing.data == desired.data && has_labels(&existing, &desired) => {
                tracing::debug!(ledger = %name, "ledger is up to date");
                Ok(existing)
            }
            Some(mut existing) => {
                existing.data = desired.data;
                existing
                    .labels_mut()
                    .extend(desired.metadata.labels.unwrap_or_default());
                self.client
                    .replace(&existing)
                    .await
                    .with_context(|_| write_context())
            }
        }
    }
}

fn has_labels(existing: &ConfigMap, desired: &ConfigMap) -> bool {
    desired
        .labels()
        .iter()
        .all(|(key, value)| existing.labels().get(key) == Some(value))
}
