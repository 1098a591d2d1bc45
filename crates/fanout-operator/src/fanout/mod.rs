//! Translation of an ordered item list into an Indexed Job, shared by both fan-out controllers.
//!
//! Item `i` of the list is processed by the pod with completion index `i`. The list is
//! rendered into a ConfigMap next to the workload, see [`shim`] for how pods find their item.

use std::{collections::BTreeMap, sync::LazyLock};

use k8s_openapi::{
    api::{batch::v1::JobSpec, core::v1::ConfigMap},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{Resource, ResourceExt};
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{
    ErrorKind,
    builder::{self, configmap::ConfigMapBuilder, meta::ObjectMetaBuilder, pod::PodTemplateBuilder},
    crd::{FanOutSpec, ItemOrigin},
    labels::{ITEM_LIST_COMPONENT, WORKLOAD_COMPONENT},
    ledger::{self, ITEMS_KEY, ItemLedger},
};

pub mod shim;

const INDEXED_COMPLETION: &str = "Indexed";
const RESTART_POLICY_NEVER: &str = "Never";

static ENV_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("failed to compile environment variable name regex")
});

const SCHEDULE_MACROS: &[&str] = &[
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@midnight",
    "@hourly",
];

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("parallelism must be at least 1, got {parallelism}"))]
    InvalidParallelism { parallelism: i32 },

    #[snafu(display("template.image must not be empty"))]
    MissingImage,

    #[snafu(display("template.command must not be empty"))]
    MissingCommand,

    #[snafu(display("{name:?} is not a valid environment variable name"))]
    InvalidEnvName { name: String },

    #[snafu(display("either staticList or listSourceRef must be specified"))]
    MissingItemSource,

    #[snafu(display(
        "schedule {schedule:?} must have five fields or be one of {}",
        SCHEDULE_MACROS.join(", ")
    ))]
    InvalidSchedule { schedule: String },

    #[snafu(display("failed to read items of ListSource {name:?}"))]
    ReadLedger { source: ledger::Error, name: String },

    #[snafu(display("ListSource {name:?} has not published any items yet"))]
    LedgerNotFound { name: String },

    #[snafu(display("ListSource {name:?} published an empty item list"))]
    EmptyLedger { name: String },

    #[snafu(display("item {index} contains a line break, items are addressed by line"))]
    MultilineItem { index: usize },

    #[snafu(display("failed to build item list ConfigMap"))]
    BuildItemList { source: builder::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParallelism { .. }
            | Self::MissingImage
            | Self::MissingCommand
            | Self::InvalidEnvName { .. }
            | Self::MissingItemSource
            | Self::InvalidSchedule { .. }
            | Self::MultilineItem { .. }
            | Self::BuildItemList { .. } => ErrorKind::ConfigInvalid,
            Self::ReadLedger { source, .. } => source.kind(),
            Self::LedgerNotFound { .. } | Self::EmptyLedger { .. } => ErrorKind::DependencyNotReady,
        }
    }
}

/// Checks the fields shared by both fan-out kinds, returning where the items come from.
pub fn validate(spec: &FanOutSpec) -> Result<ItemOrigin<'_>> {
    ensure!(
        spec.parallelism >= 1,
        InvalidParallelismSnafu {
            parallelism: spec.parallelism
        }
    );
    ensure!(!spec.template.image.trim().is_empty(), MissingImageSnafu);
    ensure!(!spec.template.command.is_empty(), MissingCommandSnafu);
    let env_name = spec.template.env_name();
    ensure!(
        ENV_NAME_REGEX.is_match(env_name),
        InvalidEnvNameSnafu { name: env_name }
    );
    spec.item_origin().context(MissingItemSourceSnafu)
}

/// Accepts five field cron expressions and the `@` macros the CronJob controller understands.
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    let valid = if schedule.starts_with('@') {
        SCHEDULE_MACROS.contains(&schedule)
    } else {
        schedule.split_whitespace().count() == 5
    };
    ensure!(valid, InvalidScheduleSnafu { schedule });
    Ok(())
}

/// Resolves the items to fan out.
///
/// Inline items are used as they are. Items of a ListSource are read from its ledger, which
/// must exist and hold at least one item: the ListSource may simply not have resolved yet.
/// Items must fit on one line of the rendered list.
pub async fn resolve_items(
    origin: ItemOrigin<'_>,
    namespace: &str,
    ledger: &ItemLedger,
) -> Result<Vec<String>> {
    let items = match origin {
        ItemOrigin::Inline(items) => items.to_vec(),
        ItemOrigin::Ledger(name) => {
            let items = ledger
                .read(namespace, name)
                .await
                .context(ReadLedgerSnafu { name })?
                .context(LedgerNotFoundSnafu { name })?;
            ensure!(!items.is_empty(), EmptyLedgerSnafu { name });
            items
        }
    };
    if let Some(index) = items.iter().position(|item| item.contains('\n')) {
        return MultilineItemSnafu { index }.fail();
    }
    Ok(items)
}

/// Name of the ConfigMap holding the rendered items of the fan-out object `owner_name`.
pub fn item_list_name(owner_name: &str) -> String {
    format!("{owner_name}-list")
}

/// Renders items one per line, the format the shim reads.
pub fn render_items(items: &[String]) -> String {
    items.iter().map(|item| format!("{item}\n")).collect()
}

/// Builds the rendered item list ConfigMap owned by `owner`.
pub fn build_item_list<T>(owner: &T, items: &[String]) -> Result<ConfigMap>
where
    T: Resource<DynamicType = ()>,
{
    let owner_name = owner.name_any();
    ConfigMapBuilder::new()
        .metadata(
            ObjectMetaBuilder::new()
                .name(item_list_name(&owner_name))
                .namespace_opt(owner.namespace())
                .ownerreference_from_resource(owner)
                .context(BuildItemListSnafu)?
                .with_recommended_labels(&owner_name, ITEM_LIST_COMPONENT)
                .build(),
        )
        .add_data(ITEMS_KEY, render_items(items))
        .build()
        .context(BuildItemListSnafu)
}

/// Builds metadata for the Job or CronJob of `owner`: same name and namespace, owned by it.
pub fn workload_metadata<T>(owner: &T) -> Result<ObjectMeta, builder::Error>
where
    T: Resource<DynamicType = ()>,
{
    Ok(ObjectMetaBuilder::new()
        .name_and_namespace(owner)
        .ownerreference_from_resource(owner)?
        .with_recommended_labels(&owner.name_any(), WORKLOAD_COMPONENT)
        .build())
}

/// Builds the Indexed Job spec processing `item_count` items.
///
/// `template_annotations` end up on the pods, a change to them changes the pod template.
pub fn job_spec(
    spec: &FanOutSpec,
    owner_name: &str,
    item_count: usize,
    shim_image: &str,
    template_annotations: BTreeMap<String, String>,
) -> JobSpec {
    let list_name = item_list_name(owner_name);
    let mut pod_metadata = ObjectMetaBuilder::new();
    pod_metadata.with_recommended_labels(owner_name, WORKLOAD_COMPONENT);
    for (key, value) in template_annotations {
        pod_metadata.with_annotation(key, value);
    }

    let mut pod_template = PodTemplateBuilder::new();
    pod_template
        .metadata(pod_metadata.build())
        .add_init_container(shim::shim_container(shim_image, spec.template.env_name()))
        .add_container(shim::main_container(&spec.template))
        .restart_policy(RESTART_POLICY_NEVER);
    for volume in shim::volumes(&list_name) {
        pod_template.add_volume(volume);
    }

    JobSpec {
        completion_mode: Some(INDEXED_COMPLETION.to_string()),
        completions: Some(item_count as i32),
        parallelism: Some(spec.parallelism),
        ttl_seconds_after_finished: spec.ttl_seconds_after_finished,
        template: pod_template.build(),
        ..JobSpec::default()
    }
}
