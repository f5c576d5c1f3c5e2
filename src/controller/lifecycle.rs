//! Ordering of a System's lifecycle actions
//!
//! Deploys and Teardowns of one System are serialized: only the newest
//! action may run. An unfinished action fails as superseded as soon as a
//! newer one exists, even if the newer one has already finished.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use super::Context;
use crate::crd::{Deploy, Teardown};

#[derive(Clone, Debug)]
pub enum LifecycleAction {
    Deploy(Arc<Deploy>),
    Teardown(Arc<Teardown>),
}

impl LifecycleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleAction::Deploy(_) => "Deploy",
            LifecycleAction::Teardown(_) => "Teardown",
        }
    }

    pub fn name(&self) -> String {
        match self {
            LifecycleAction::Deploy(d) => d.name_any(),
            LifecycleAction::Teardown(t) => t.name_any(),
        }
    }

    fn created(&self) -> Option<&Time> {
        match self {
            LifecycleAction::Deploy(d) => d.metadata.creation_timestamp.as_ref(),
            LifecycleAction::Teardown(t) => t.metadata.creation_timestamp.as_ref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            LifecycleAction::Deploy(d) => d.status.as_ref().is_some_and(|s| s.state.is_terminal()),
            LifecycleAction::Teardown(t) => {
                t.status.as_ref().is_some_and(|s| s.state.is_terminal())
            }
        }
    }

    /// Creation time, then name, then kind
    fn order(&self, other: &Self) -> Ordering {
        self.created()
            .map(|t| t.0)
            .cmp(&other.created().map(|t| t.0))
            .then_with(|| self.name().cmp(&other.name()))
            .then_with(|| self.kind().cmp(other.kind()))
    }

    fn is(&self, kind: &str, name: &str) -> bool {
        self.kind() == kind && self.name() == name
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}

/// Snapshot of the lifecycle actions in one System namespace
pub struct LifecycleActions {
    actions: Vec<LifecycleAction>,
}

impl LifecycleActions {
    pub fn load(ctx: &Context, namespace: &str) -> Self {
        let actions: Vec<LifecycleAction> = ctx
            .cache::<Deploy>()
            .list(Some(namespace))
            .into_iter()
            .map(LifecycleAction::Deploy)
            .chain(
                ctx.cache::<Teardown>()
                    .list(Some(namespace))
                    .into_iter()
                    .map(LifecycleAction::Teardown),
            )
            .collect();
        Self::from_actions(actions)
    }

    pub(crate) fn from_actions(mut actions: Vec<LifecycleAction>) -> Self {
        actions.sort_by(|a, b| a.order(b));
        Self { actions }
    }

    /// All actions, oldest first
    pub fn all(&self) -> &[LifecycleAction] {
        &self.actions
    }

    /// The newest action, if it has not finished
    pub fn active(&self) -> Option<&LifecycleAction> {
        self.latest().filter(|a| !a.is_terminal())
    }

    /// The newest action of all, finished or not
    pub fn latest(&self) -> Option<&LifecycleAction> {
        self.actions.last()
    }

    /// The action that supersedes `kind/name`, if it has been superseded
    pub fn superseded_by(&self, kind: &str, name: &str) -> Option<&LifecycleAction> {
        let position = self.actions.iter().position(|a| a.is(kind, name))?;
        self.actions[position + 1..].last()
    }

    pub fn latest_succeeded_deploy(&self) -> Option<&Arc<Deploy>> {
        self.actions.iter().rev().find_map(|a| match a {
            LifecycleAction::Deploy(d)
                if d.status
                    .as_ref()
                    .is_some_and(|s| s.state == crate::crd::DeployState::Succeeded) =>
            {
                Some(d)
            }
            _ => None,
        })
    }
}
