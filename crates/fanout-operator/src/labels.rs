//! Labels and annotations the operator puts on the objects it manages.

use std::collections::BTreeMap;

use const_format::concatcp;

use crate::{OPERATOR_NAME, crd::GROUP};

const APP_KUBERNETES_LABEL_BASE: &str = "app.kubernetes.io/";

/// A unique name identifying the instance of an application, here the owning object's name
pub const APP_INSTANCE_LABEL: &str = concatcp!(APP_KUBERNETES_LABEL_BASE, "instance");
/// The component within the architecture, see the `*_COMPONENT` constants
pub const APP_COMPONENT_LABEL: &str = concatcp!(APP_KUBERNETES_LABEL_BASE, "component");
/// The tool being used to manage the operation of an application
pub const APP_MANAGED_BY_LABEL: &str = concatcp!(APP_KUBERNETES_LABEL_BASE, "managed-by");

/// Component of the ConfigMap a ListSource publishes its items to
pub const ITEM_LEDGER_COMPONENT: &str = "item-ledger";
/// Component of the ConfigMap a fan-out object mounts into its pods
pub const ITEM_LIST_COMPONENT: &str = "item-list";
/// Component of Jobs and CronJobs created for fan-out objects
pub const WORKLOAD_COMPONENT: &str = "workload";

/// Selects every item ledger managed by this operator
pub const ITEM_LEDGER_SELECTOR: &str = concatcp!(
    APP_MANAGED_BY_LABEL,
    "=",
    OPERATOR_NAME,
    ",",
    APP_COMPONENT_LABEL,
    "=",
    ITEM_LEDGER_COMPONENT
);
/// Selects every rendered item list managed by this operator
pub const ITEM_LIST_SELECTOR: &str = concatcp!(
    APP_MANAGED_BY_LABEL,
    "=",
    OPERATOR_NAME,
    ",",
    APP_COMPONENT_LABEL,
    "=",
    ITEM_LIST_COMPONENT
);

/// Selects every Job and CronJob managed by this operator
pub const WORKLOAD_SELECTOR: &str = concatcp!(
    APP_MANAGED_BY_LABEL,
    "=",
    OPERATOR_NAME,
    ",",
    APP_COMPONENT_LABEL,
    "=",
    WORKLOAD_COMPONENT
);

/// Pod template annotation carrying the resource version of the item list a CronJob was rendered from.
///
/// Any change of the list changes the template and therefore the pods of future runs.
pub const ITEMS_VERSION_ANNOTATION: &str = concatcp!(GROUP, "/items-version");
/// Hash over the desired CronJob spec, compared to decide whether the live CronJob is stale
pub const SPEC_HASH_ANNOTATION: &str = concatcp!(GROUP, "/spec-hash");

/// Creates the labels shared by every object the operator manages on behalf of `instance`.
pub fn recommended_labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
        (APP_COMPONENT_LABEL.to_string(), component.to_string()),
        (APP_INSTANCE_LABEL.to_string(), instance.to_string()),
    ])
}
