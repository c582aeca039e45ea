//! Polling of asynchronous Hetzner Cloud actions.

use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::Method;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::types::{Action, ActionStatus, ActionsEnvelope};
use super::{HcloudError, HcloudProvider};
use crate::provider::{ActionHandle, ProviderFuture};

/// Reports the current state of a set of actions.
pub(super) trait ActionSource: Sync {
    fn fetch<'a>(&'a self, ids: &'a [u64]) -> ProviderFuture<'a, Vec<Action>, HcloudError>;
}

impl ActionSource for HcloudProvider {
    fn fetch<'a>(&'a self, ids: &'a [u64]) -> ProviderFuture<'a, Vec<Action>, HcloudError> {
        Box::pin(async move {
            let path = "/actions";
            let query: Vec<(&str, u64)> = ids.iter().map(|id| ("id", *id)).collect();
            let envelope: ActionsEnvelope = self
                .send(path, self.request(Method::GET, path).query(&query))
                .await?;
            Ok(envelope.actions)
        })
    }
}

impl HcloudProvider {
    pub(super) async fn poll_actions(
        &self,
        actions: &[ActionHandle],
        cancel: &CancellationToken,
    ) -> Result<(), HcloudError> {
        poll_until_settled(self, actions, self.poll_interval, self.action_timeout, cancel).await
    }
}

/// Polls `source` until every action succeeded.
///
/// A timeout too large to represent as an instant means no deadline.
pub(super) async fn poll_until_settled<S: ActionSource + ?Sized>(
    source: &S,
    actions: &[ActionHandle],
    poll_interval: Duration,
    action_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), HcloudError> {
    let mut pending: BTreeSet<u64> = actions.iter().map(|action| action.id).collect();
    let deadline = Instant::now().checked_add(action_timeout);

    while !pending.is_empty() {
        if cancel.is_cancelled() {
            return Err(HcloudError::Cancelled);
        }

        let ids: Vec<u64> = pending.iter().copied().collect();
        let polled = tokio::select! {
            () = cancel.cancelled() => return Err(HcloudError::Cancelled),
            fetched = source.fetch(&ids) => fetched?,
        };

        for action in polled {
            match action.status {
                ActionStatus::Running => {}
                ActionStatus::Success => {
                    pending.remove(&action.id);
                }
                ActionStatus::Error => return Err(action_failure(action)),
            }
        }

        if pending.is_empty() {
            break;
        }

        if deadline.is_some_and(|limit| Instant::now() >= limit) {
            return Err(timeout_error(actions, &pending));
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(HcloudError::Cancelled),
            () = sleep(poll_interval) => {}
        }
    }

    Ok(())
}

fn action_failure(action: Action) -> HcloudError {
    let (code, message) = action.error.map_or_else(
        || (String::from("unknown"), String::from("no error details")),
        |err| (err.code, err.message),
    );
    HcloudError::ActionFailed {
        id: action.id,
        command: action.command,
        code,
        message,
    }
}

fn timeout_error(actions: &[ActionHandle], pending: &BTreeSet<u64>) -> HcloudError {
    actions
        .iter()
        .find(|action| pending.contains(&action.id))
        .map_or_else(
            || HcloudError::ActionTimeout {
                id: pending.first().copied().unwrap_or_default(),
                command: String::from("unknown"),
            },
            |action| HcloudError::ActionTimeout {
                id: action.id,
                command: action.command.clone(),
            },
        )
}
