//! A Kubernetes operator that turns a list of items into an indexed batch workload.
//!
//! Items come either inline from a fan-out object or from a [`crd::list_source::ListSource`],
//! which periodically resolves them from a static list, an HTTP API or a SQL query and
//! publishes them to an item ledger. [`crd::fanout_job::FanOutJob`] runs one pod per item
//! exactly once, [`crd::fanout_schedule::FanOutSchedule`] does so on a cron schedule.

pub mod builder;
pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod error;
pub mod fanout;
pub mod finalizer;
pub mod labels;
pub mod ledger;
pub mod logging;
pub mod namespace;
pub mod secret;
pub mod source;
pub mod time;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::error::ErrorKind;

/// Name of the operator, used as field manager, event reporter and `managed-by` label value.
pub const OPERATOR_NAME: &str = "fanout-operator";
