//! Conditional promotion of a temporary object to its final key.
//!
//! Two strategies share one contract:
//!
//! - **native**: the store renames the temporary object under the
//!   precondition in a single atomic call.
//! - **copy then delete**: the store copies the temporary object to the final
//!   key under the precondition, then the temporary object is deleted. The
//!   delete is best effort; once the copy succeeded the commit has succeeded.
//!
//! A failed precondition means a concurrent transfer already made the final
//! object visible. That is reported as
//! [`CommitResolution::ConflictAlreadyExists`], not as an error.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreErrorKind};
use crate::retry::{RetryError, RetryPolicy, classify_store_error};
use crate::store::{DestinationStore, PromoteCapability, PromoteStatus};
use crate::types::{CommitResolution, Precondition, TempObjectHandle};

/// Which promote strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromoteMode {
    /// Whatever the destination advertises.
    #[default]
    Auto,
    /// The native conditional rename. Falls back to copy then delete on
    /// stores that cannot rename.
    Native,
    /// Always copy then delete.
    Copy,
}

impl FromStr for PromoteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "copy" => Ok(Self::Copy),
            other => Err(format!("unknown promote mode {other:?}")),
        }
    }
}

impl fmt::Display for PromoteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Native => f.write_str("native"),
            Self::Copy => f.write_str("copy"),
        }
    }
}

/// Makes a sealed temporary object visible under its final key.
#[derive(Debug, Clone)]
pub struct CommitManager {
    retry: RetryPolicy,
    mode: PromoteMode,
}

impl CommitManager {
    /// Create a commit manager.
    #[must_use]
    pub fn new(retry: RetryPolicy, mode: PromoteMode) -> Self {
        Self { retry, mode }
    }

    /// The strategy that will be used against `destination`.
    ///
    /// Copy then delete works on every store, so it can always be forced.
    /// Native can only be used where the store supports it.
    #[must_use]
    pub fn strategy(&self, destination: &dyn DestinationStore) -> PromoteCapability {
        let supported = destination.promote_capability();
        match self.mode {
            PromoteMode::Auto => supported,
            PromoteMode::Native if supported == PromoteCapability::CopyThenDelete => {
                warn!(
                    mode = %self.mode,
                    %supported,
                    "destination has no native promote, using copy then delete"
                );
                PromoteCapability::CopyThenDelete
            }
            PromoteMode::Native => PromoteCapability::Native,
            PromoteMode::Copy => PromoteCapability::CopyThenDelete,
        }
    }

    /// Promote `temp` under `precondition`.
    ///
    /// # Errors
    ///
    /// Returns the retry error of the promote (or copy) call. Failures of the
    /// cleanup delete are logged and never returned.
    pub async fn commit(
        &self,
        destination: &dyn DestinationStore,
        temp: &TempObjectHandle,
        precondition: &Precondition,
    ) -> Result<CommitResolution, RetryError<StoreError>> {
        let strategy = self.strategy(destination);
        debug!(
            key = %temp.final_key,
            temp_key = %temp.temp_key,
            %strategy,
            %precondition,
            "committing temporary object"
        );

        let status = match strategy {
            PromoteCapability::Native => {
                self.conditional(|| destination.promote_if(&temp.temp_key, &temp.final_key, precondition))
                    .await?
            }
            PromoteCapability::CopyThenDelete => {
                self.conditional(|| destination.copy_if(&temp.temp_key, &temp.final_key, precondition))
                    .await?
            }
        };

        match status {
            PromoteStatus::Promoted => {
                if strategy == PromoteCapability::CopyThenDelete {
                    self.remove_temp(destination, temp).await;
                }
                Ok(CommitResolution::Promoted)
            }
            PromoteStatus::PreconditionFailed => {
                debug!(key = %temp.final_key, "final object already promoted by a concurrent transfer");
                self.remove_temp(destination, temp).await;
                Ok(CommitResolution::ConflictAlreadyExists)
            }
        }
    }

    /// Run a conditional call under retry. A precondition error surfaced as
    /// an `Err` by the adapter counts as a lost race.
    async fn conditional<F, Fut>(&self, call: F) -> Result<PromoteStatus, RetryError<StoreError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<PromoteStatus, StoreError>>,
    {
        match self.retry.execute(|_| call(), classify_store_error).await {
            Err(RetryError::Permanent { error, .. })
                if error.kind == StoreErrorKind::PreconditionFailed =>
            {
                Ok(PromoteStatus::PreconditionFailed)
            }
            other => other,
        }
    }

    async fn remove_temp(&self, destination: &dyn DestinationStore, temp: &TempObjectHandle) {
        let result = self
            .retry
            .execute(|_| destination.delete(&temp.temp_key), classify_store_error)
            .await;
        if let Err(e) = result {
            warn!(
                temp_key = %temp.temp_key,
                error = %e,
                "could not delete temporary object, leaving it for the orphan sweep"
            );
        }
    }
}
