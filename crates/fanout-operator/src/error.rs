use std::time::Duration;

use strum::{Display, EnumIter};

/// Coarse classification of every failure a reconciler can run into.
///
/// The kind decides how a failure is retried, see [`ErrorKind::retry_policy`].
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The object is malformed. Retrying will not help until the object changes.
    ConfigInvalid,

    /// An upstream (API endpoint, database, secret read) failed transiently.
    FetchFailed,

    /// A referenced ledger or secret does not exist yet.
    DependencyNotReady,

    /// An optimistic concurrency conflict on a write.
    PlatformConflict,

    /// Any other control plane failure.
    Platform,
}

/// What a controller should do after a failed reconciliation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryPolicy {
    /// Wait until the object itself changes.
    AwaitChange,

    /// Try again after the given delay.
    RequeueAfter(Duration),
}

const DEPENDENCY_RETRY_DELAY: Duration = Duration::from_secs(5);
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(1);

impl ErrorKind {
    /// Maps the kind to a retry policy, falling back to `default_delay` for
    /// upstream and generic control plane failures.
    pub fn retry_policy(self, default_delay: Duration) -> RetryPolicy {
        match self {
            Self::ConfigInvalid => RetryPolicy::AwaitChange,
            Self::DependencyNotReady => RetryPolicy::RequeueAfter(DEPENDENCY_RETRY_DELAY),
            Self::PlatformConflict => RetryPolicy::RequeueAfter(CONFLICT_RETRY_DELAY),
            Self::FetchFailed | Self::Platform => RetryPolicy::RequeueAfter(default_delay),
        }
    }
}
