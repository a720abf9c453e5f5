//! Policy engine: named access rule sets with a lambda → policy reverse
//! index. A lambda carries at most one policy; applying a new one
//! atomically unbinds the previous.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sp_domain::config::atomic_write_json;
use sp_domain::{CapturedRequest, Error, Policy, PolicyDefinition, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    policies: Vec<Policy>,
}

struct EngineState {
    by_id: HashMap<String, Policy>,
    by_lambda: HashMap<String, String>,
}

pub struct Engine {
    store_path: PathBuf,
    inner: RwLock<EngineState>,
}

impl Engine {
    /// Load the policy list from `policies.json`; a missing file is an
    /// empty engine.
    pub fn open(store_path: impl Into<PathBuf>) -> Result<Engine> {
        let store_path = store_path.into();
        let list = match std::fs::read(&store_path) {
            Ok(data) => serde_json::from_slice::<PolicyFile>(&data)?.policies,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut by_id = HashMap::new();
        let mut by_lambda = HashMap::new();
        for policy in list {
            for lambda in &policy.lambdas {
                by_lambda.insert(lambda.clone(), policy.id.clone());
            }
            by_id.insert(policy.id.clone(), policy);
        }
        Ok(Engine {
            store_path,
            inner: RwLock::new(EngineState { by_id, by_lambda }),
        })
    }

    pub fn list(&self) -> Vec<Policy> {
        let state = self.inner.read();
        let mut list: Vec<Policy> = state.by_id.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn create(&self, id: &str, definition: PolicyDefinition) -> Result<Policy> {
        let mut state = self.inner.write();
        if state.by_id.contains_key(id) {
            return Err(Error::Conflict(format!("policy {id} already exists")));
        }
        let policy = Policy {
            id: id.to_string(),
            definition,
            lambdas: Default::default(),
        };
        state.by_id.insert(id.to_string(), policy.clone());
        self.persist(&state)?;
        Ok(policy)
    }

    pub fn update(&self, id: &str, definition: PolicyDefinition) -> Result<()> {
        let mut state = self.inner.write();
        let policy = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("policy {id} does not exist")))?;
        policy.definition = definition;
        self.persist(&state)?;
        Ok(())
    }

    /// Remove the policy and every binding pointing at it.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.inner.write();
        let policy = state
            .by_id
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("policy {id} does not exist")))?;
        for lambda in &policy.lambdas {
            state.by_lambda.remove(lambda);
        }
        self.persist(&state)?;
        Ok(())
    }

    /// Bind `lambda` to the policy, atomically replacing any previous
    /// binding. Applying the same policy twice is a no-op.
    pub fn apply(&self, lambda: &str, id: &str) -> Result<()> {
        let mut state = self.inner.write();
        if !state.by_id.contains_key(id) {
            return Err(Error::NotFound(format!("policy {id} does not exist")));
        }
        if state.by_id[id].lambdas.contains(lambda) {
            return Ok(()); // already applied
        }
        unbind(&mut state, lambda);
        state
            .by_id
            .get_mut(id)
            .expect("checked above")
            .lambdas
            .insert(lambda.to_string());
        state.by_lambda.insert(lambda.to_string(), id.to_string());
        self.persist(&state)?;
        Ok(())
    }

    /// Drop the lambda's binding, if any.
    pub fn clear(&self, lambda: &str) -> Result<()> {
        let mut state = self.inner.write();
        if !unbind(&mut state, lambda) {
            return Ok(());
        }
        self.persist(&state)?;
        Ok(())
    }

    /// Decide whether `request` may reach `lambda`. No binding means allow;
    /// a binding pointing at an unknown policy is corruption and denies.
    pub fn inspect(&self, lambda: &str, request: &CapturedRequest) -> Result<()> {
        let state = self.inner.read();
        let Some(id) = state.by_lambda.get(lambda) else {
            return Ok(());
        };
        let Some(policy) = state.by_id.get(id) else {
            return Err(Error::Corruption(format!(
                "lambda {lambda} is bound to unknown policy {id}"
            )));
        };
        check(&policy.definition, request)
    }

    fn persist(&self, state: &EngineState) -> Result<()> {
        let mut policies: Vec<Policy> = state.by_id.values().cloned().collect();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        atomic_write_json(&self.store_path, &PolicyFile { policies })
    }
}

fn unbind(state: &mut EngineState, lambda: &str) -> bool {
    let Some(id) = state.by_lambda.remove(lambda) else {
        return false;
    };
    if let Some(policy) = state.by_id.get_mut(&id) {
        policy.lambdas.remove(lambda);
    }
    true
}

/// Ordered short-circuit check: client IP, then Origin, then token.
fn check(definition: &PolicyDefinition, request: &CapturedRequest) -> Result<()> {
    if !definition.allowed_ip.is_empty()
        && !definition.allowed_ip.contains(request.client_host())
    {
        return Err(Error::Forbidden("IP restricted".into()));
    }
    if !definition.allowed_origin.is_empty() {
        let origin = request.header("Origin").unwrap_or_default();
        if !definition.allowed_origin.contains(origin) {
            return Err(Error::Forbidden("origin restricted".into()));
        }
    }
    if !definition.public {
        let token = request.header("Authorization").unwrap_or_default();
        if !definition.tokens.contains_key(token) {
            return Err(Error::Forbidden("token restricted".into()));
        }
    }
    Ok(())
}
