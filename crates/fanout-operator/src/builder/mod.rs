//! Builders for the Kubernetes objects the operator renders.
//!
//! They follow the `&mut self` builder style: every setter returns `&mut Self` and
//! [`build`](meta::ObjectMetaBuilder::build) clones the accumulated state.

use snafu::Snafu;

pub mod configmap;
pub mod meta;
pub mod pod;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("object is missing key {key:?}"))]
    MissingObjectKey { key: &'static str },

    #[snafu(display("owner {name:?} has no uid, it has probably not been persisted yet"))]
    OwnerWithoutUid { name: String },
}
