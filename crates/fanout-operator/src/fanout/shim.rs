//! The index resolution shim: an init container picking the item of its pod.
//!
//! Indexed Jobs give every pod a completion index. The shim reads the rendered item list,
//! selects the line at that index and writes an `export` statement the main container
//! sources before running the user command.

use k8s_openapi::api::core::v1::{Container, Volume};

use crate::{
    builder::pod::{ContainerBuilder, FieldPathEnvVar, config_map_volume, empty_dir_volume},
    crd::JobTemplate,
    ledger::ITEMS_KEY,
};

pub const DEFAULT_SHIM_IMAGE: &str = "busybox:1.36";

pub const SHIM_CONTAINER_NAME: &str = "resolve-item";
pub const MAIN_CONTAINER_NAME: &str = "main";

const LIST_VOLUME: &str = "item-list";
const SHARED_VOLUME: &str = "shared";
const LIST_MOUNT_PATH: &str = "/fanout/list";
const SHARED_MOUNT_PATH: &str = "/fanout/shared";

/// File the shim writes and the main container sources
pub const ITEM_ENV_FILE: &str = "/fanout/shared/item.env";

const INDEX_ENV: &str = "JOB_COMPLETION_INDEX";
const ENV_NAME_ENV: &str = "FANOUT_ENV_NAME";
const LIST_FILE_ENV: &str = "FANOUT_LIST_FILE";
const ITEM_ENV_FILE_ENV: &str = "FANOUT_ITEM_ENV_FILE";

// Every line of the list file is one item, the list ends with a newline.
// Single quotes in the item are written as '\'' so the export survives any content.
const SHIM_SCRIPT: &str = r#"set -eu
index="${JOB_COMPLETION_INDEX:-}"
case "$index" in
  ''|*[!0-9]*)
    echo "invalid completion index '$index'" >&2
    exit 1
    ;;
esac
count=$(wc -l < "$FANOUT_LIST_FILE" | tr -d ' ')
if [ "$index" -ge "$count" ]; then
  echo "completion index $index is out of range for $count items" >&2
  exit 1
fi
item=$(sed -n "$((index + 1))p" "$FANOUT_LIST_FILE")
escaped=$(printf '%s' "$item" | sed "s/'/'\\\\''/g")
printf "export %s='%s'\n" "$FANOUT_ENV_NAME" "$escaped" > "$FANOUT_ITEM_ENV_FILE"
"#;

/// Builds the init container resolving the item of the pod.
pub fn shim_container(image: &str, env_name: &str) -> Container {
    ContainerBuilder::new(SHIM_CONTAINER_NAME)
        .image(image)
        .command(vec!["sh".to_string(), "-c".to_string(), SHIM_SCRIPT.to_string()])
        .add_env_var_from_field_path(INDEX_ENV, &FieldPathEnvVar::JobCompletionIndex)
        .add_env_var(ENV_NAME_ENV, env_name)
        .add_env_var(LIST_FILE_ENV, format!("{LIST_MOUNT_PATH}/{ITEMS_KEY}"))
        .add_env_var(ITEM_ENV_FILE_ENV, ITEM_ENV_FILE)
        .add_volume_mount(LIST_VOLUME, LIST_MOUNT_PATH, true)
        .add_volume_mount(SHARED_VOLUME, SHARED_MOUNT_PATH, false)
        .build()
}

/// Builds the container running the user command with the item exported.
pub fn main_container(template: &JobTemplate) -> Container {
    let script = format!(". {ITEM_ENV_FILE} && {}", template.command.join(" "));
    ContainerBuilder::new(MAIN_CONTAINER_NAME)
        .image(&template.image)
        .command(vec!["sh".to_string(), "-c".to_string(), script])
        .resources_opt(template.resources.clone())
        .add_volume_mount(SHARED_VOLUME, SHARED_MOUNT_PATH, true)
        .build()
}

/// The volumes both containers rely on: the rendered list and the scratch space in between.
pub fn volumes(item_list_name: &str) -> Vec<Volume> {
    vec![
        config_map_volume(LIST_VOLUME, item_list_name),
        empty_dir_volume(SHARED_VOLUME),
    ]
}
