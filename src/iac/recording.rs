//! In-process engine that records invocations instead of running them

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{IacConfig, IacEngine, PlanResult, StateKey};
use crate::crd::meta::short_hash;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IacOperation {
    Plan,
    Apply,
    Destroy,
    Output,
}

impl IacOperation {
    fn as_str(self) -> &'static str {
        match self {
            IacOperation::Plan => "plan",
            IacOperation::Apply => "apply",
            IacOperation::Destroy => "destroy",
            IacOperation::Output => "output",
        }
    }
}

/// One call made against the engine
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub operation: IacOperation,
    /// Remote state path of the key the call was made for
    pub key: String,
    /// Set for destroy plans
    pub destroy: bool,
    pub config: Value,
}

struct ScriptedFailure {
    operation: IacOperation,
    key_contains: String,
    message: String,
}

#[derive(Default)]
struct State {
    invocations: Vec<Invocation>,
    applied: BTreeMap<String, Value>,
    outputs: BTreeMap<(String, String), String>,
    failures: Vec<ScriptedFailure>,
}

/// Engine that keeps "infrastructure" as the last config applied per state
/// key. A plan is empty exactly when applying would not change that config.
///
/// Failures can be scripted per operation and key, which is how tests
/// exercise error paths.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    state: Arc<Mutex<State>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every later `operation` on a key whose path contains `key_contains`
    pub fn fail(&self, operation: IacOperation, key_contains: &str, message: &str) {
        self.lock().failures.push(ScriptedFailure {
            operation,
            key_contains: key_contains.to_string(),
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Script the value `output` returns for `name` under `key`
    pub fn set_output(&self, key: &StateKey, name: &str, value: &str) {
        self.lock()
            .outputs
            .insert((key.path(), name.to_string()), value.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn count(&self, operation: IacOperation) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|i| i.operation == operation)
            .count()
    }

    /// State paths currently holding applied infrastructure
    pub fn applied_keys(&self) -> Vec<String> {
        self.lock().applied.keys().cloned().collect()
    }

    pub fn applied_config(&self, key: &StateKey) -> Option<Value> {
        self.lock().applied.get(&key.path()).cloned()
    }

    fn record(
        &self,
        operation: IacOperation,
        key: &StateKey,
        destroy: bool,
        config: &IacConfig,
    ) -> Result<(MutexGuard<'_, State>, Value)> {
        let config = config.to_value()?;
        let path = key.path();
        let mut state = self.lock();
        state.invocations.push(Invocation {
            operation,
            key: path.clone(),
            destroy,
            config: config.clone(),
        });
        if let Some(failure) = state
            .failures
            .iter()
            .find(|f| f.operation == operation && path.contains(&f.key_contains))
        {
            #[cfg(feature = "metrics")]
            crate::controller::metrics::record_iac_invocation(operation.as_str(), "error");
            return Err(Error::IacError {
                operation: operation.as_str().to_string(),
                work_dir: path,
                message: failure.message.clone(),
            });
        }
        #[cfg(feature = "metrics")]
        crate::controller::metrics::record_iac_invocation(operation.as_str(), "success");
        Ok((state, config))
    }
}

#[async_trait]
impl IacEngine for RecordingEngine {
    async fn plan(&self, key: &StateKey, config: &IacConfig, destroy: bool) -> Result<PlanResult> {
        let (state, config) = self.record(IacOperation::Plan, key, destroy, config)?;
        let applied = state.applied.get(&key.path());
        let changes = if destroy {
            applied.is_some()
        } else {
            applied != Some(&config)
        };
        Ok(if changes {
            PlanResult::NonEmpty
        } else {
            PlanResult::Empty
        })
    }

    async fn apply(&self, key: &StateKey, config: &IacConfig) -> Result<()> {
        let (mut state, config) = self.record(IacOperation::Apply, key, false, config)?;
        state.applied.insert(key.path(), config);
        info!(state_key = %key, "Recorded apply");
        Ok(())
    }

    async fn destroy(&self, key: &StateKey, config: &IacConfig) -> Result<()> {
        let (mut state, _) = self.record(IacOperation::Destroy, key, true, config)?;
        state.applied.remove(&key.path());
        info!(state_key = %key, "Recorded destroy");
        Ok(())
    }

    async fn output(
        &self,
        key: &StateKey,
        config: &IacConfig,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>> {
        let (state, _) = self.record(IacOperation::Output, key, false, config)?;
        let path = key.path();
        Ok(names
            .iter()
            .map(|name| {
                let value = state
                    .outputs
                    .get(&(path.clone(), name.to_string()))
                    .cloned()
                    .unwrap_or_else(|| format!("{}.elb.local", short_hash(&path)));
                (name.to_string(), value)
            })
            .collect())
    }
}
