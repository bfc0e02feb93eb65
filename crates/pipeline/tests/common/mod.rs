//! Shared fixtures for pipeline integration tests.
//!
//! [`MemoryStore`] implements the store traits over a mutex-guarded map with
//! the same lock rules as the PostgreSQL store, so the executor and the
//! dispatcher can be exercised without a database. Playbooks are real shell
//! scripts run through `sh`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use drover_core::command::playbook_name;
use drover_core::config::{ExecutionConfig, PlaybookConfig};
use drover_core::locking::{is_lock_available, LockAttempt};
use drover_core::markers::InstalledLibraryInfo;
use drover_core::request::{RequestKind, RequestState};
use drover_core::types::DbId;
use drover_db::models::initialization::InitializationPlan;
use drover_db::models::installed_library::InstalledLibrary;
use drover_db::models::request::{CreateRequest, Request};
use drover_db::models::target::Target;
use drover_db::models::virtual_env::VirtualEnv;
use drover_pipeline::locking::lock_key;
use drover_pipeline::store::{InventoryStore, RequestStore, StoreError};

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    next_id: DbId,
    requests: BTreeMap<DbId, Request>,
    targets: BTreeMap<DbId, Target>,
    virtual_envs: BTreeMap<DbId, VirtualEnv>,
    libraries: BTreeMap<DbId, InstalledLibrary>,
    /// Every chunk passed to `append_output`, in call order.
    appends: Vec<(DbId, String)>,
    /// When set, `append_output` fails as if the database went away.
    fail_appends: bool,
}

impl State {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn insert_request(&mut self, input: &CreateRequest, triggered: bool) -> Request {
        let id = self.next_id();
        let now = Utc::now();
        let request = Request {
            id,
            uuid: uuid::Uuid::new_v4(),
            target_id: input.target_id,
            scope_name: input.scope_name.clone(),
            kind: input.kind.as_str().to_string(),
            state_id: RequestState::Pending.id(),
            output: String::new(),
            payload: if input.payload.is_null() {
                serde_json::json!({})
            } else {
                input.payload.clone()
            },
            parent_request_id: input.parent_request_id,
            triggered_at: triggered.then_some(now),
            created_at: now,
            updated_at: now,
        };
        self.requests.insert(id, request.clone());
        request
    }

    fn ensure_env(&mut self, target_id: DbId, name: &str) -> DbId {
        if let Some(env) = self
            .virtual_envs
            .values()
            .find(|e| e.target_id == target_id && e.name == name)
        {
            return env.id;
        }
        let id = self.next_id();
        let now = Utc::now();
        self.virtual_envs.insert(
            id,
            VirtualEnv {
                id,
                target_id,
                name: name.to_string(),
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn remove_env(&mut self, env_id: DbId) {
        self.virtual_envs.remove(&env_id);
        self.libraries
            .retain(|_, lib| lib.virtual_environment_id != env_id);
    }

    fn request_mut(&mut self, id: DbId) -> Result<&mut Request, StoreError> {
        self.requests.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "request",
            id,
        })
    }
}

/// Store keeping everything in memory.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target(&self, image_name: &str) -> Target {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let now = Utc::now();
        let target = Target {
            id,
            uuid: uuid::Uuid::new_v4(),
            name: format!("target-{id}"),
            address: "192.0.2.10".to_string(),
            image_name: image_name.to_string(),
            credential_ref: "credential".to_string(),
            virtual_envs_dir_path: "virtual-envs".to_string(),
            python_version: None,
            created_at: now,
            updated_at: now,
        };
        state.targets.insert(id, target.clone());
        target
    }

    pub fn add_request(
        &self,
        target_id: DbId,
        kind: RequestKind,
        scope: Option<&str>,
        payload: serde_json::Value,
    ) -> Request {
        let input = CreateRequest {
            target_id,
            kind,
            scope_name: scope.map(str::to_string),
            payload,
            parent_request_id: None,
        };
        self.state.lock().unwrap().insert_request(&input, false)
    }

    /// Make every following `append_output` call fail until switched off.
    pub fn fail_appends(&self, fail: bool) {
        self.state.lock().unwrap().fail_appends = fail;
    }

    /// Force a request into `state`, bypassing the lock rules.
    pub fn set_state(&self, id: DbId, state: RequestState) {
        let mut guard = self.state.lock().unwrap();
        if let Some(request) = guard.requests.get_mut(&id) {
            request.state_id = state.id();
        }
    }

    pub fn request(&self, id: DbId) -> Request {
        self.state.lock().unwrap().requests[&id].clone()
    }

    pub fn target(&self, id: DbId) -> Target {
        self.state.lock().unwrap().targets[&id].clone()
    }

    pub fn all_requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.values().cloned().collect()
    }

    pub fn appends(&self, id: DbId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .appends
            .iter()
            .filter(|(rid, _)| *rid == id)
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }

    pub fn seed_env(&self, target_id: DbId, name: &str, libraries: &[(&str, &str)]) -> DbId {
        let mut state = self.state.lock().unwrap();
        let env_id = state.ensure_env(target_id, name);
        for (lib_name, version) in libraries {
            let id = state.next_id();
            state.libraries.insert(
                id,
                InstalledLibrary {
                    id,
                    virtual_environment_id: env_id,
                    name: lib_name.to_string(),
                    version: version.to_string(),
                    created_at: Utc::now(),
                },
            );
        }
        env_id
    }

    pub fn env_names(&self, target_id: DbId) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .virtual_envs
            .values()
            .filter(|e| e.target_id == target_id)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    /// `(name, version)` pairs of one environment, sorted by name.
    pub fn libraries(&self, target_id: DbId, env_name: &str) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        let Some(env) = state
            .virtual_envs
            .values()
            .find(|e| e.target_id == target_id && e.name == env_name)
        else {
            return Vec::new();
        };
        let mut libs: Vec<(String, String)> = state
            .libraries
            .values()
            .filter(|l| l.virtual_environment_id == env.id)
            .map(|l| (l.name.clone(), l.version.clone()))
            .collect();
        libs.sort();
        libs
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn find_request(&self, id: DbId) -> Result<Option<Request>, StoreError> {
        Ok(self.state.lock().unwrap().requests.get(&id).cloned())
    }

    async fn create_request(&self, input: &CreateRequest) -> Result<Request, StoreError> {
        Ok(self.state.lock().unwrap().insert_request(input, false))
    }

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Request>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .requests
            .values()
            .filter(|r| r.parent_request_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn append_output(&self, id: DbId, chunk: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_appends {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        state.request_mut(id)?.output.push_str(chunk);
        state.appends.push((id, chunk.to_string()));
        Ok(())
    }

    async fn set_output(&self, id: DbId, output: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.request_mut(id)?.output = output.to_string();
        Ok(())
    }

    async fn transition(
        &self,
        id: DbId,
        from: RequestState,
        to: RequestState,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let request = state.request_mut(id)?;
        if request.state_id != from.id() || !from.can_transition_to(to) {
            return Ok(false);
        }
        request.state_id = to.id();
        Ok(true)
    }

    async fn is_processing_allowed(&self, request: &Request) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(no_conflict(&state, request))
    }

    async fn try_lock(&self, request: &Request) -> Result<LockAttempt, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !no_conflict(&state, request) {
            return Ok(LockAttempt::Denied);
        }
        let stored = state.request_mut(request.id)?;
        if stored.state_id != RequestState::Pending.id() {
            return Ok(LockAttempt::NotPending);
        }
        stored.state_id = RequestState::Scheduled.id();
        stored.triggered_at = None;
        Ok(LockAttempt::Acquired)
    }

    async fn release(&self, id: DbId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let request = state.request_mut(id)?;
        let holds = RequestState::from_id(request.state_id).is_some_and(|s| s.holds_lock());
        if holds {
            request.state_id = RequestState::Failed.id();
        }
        Ok(holds)
    }

    async fn mark_triggered(&self, id: DbId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let request = state.request_mut(id)?;
        if request.state_id != RequestState::Pending.id() {
            return Ok(false);
        }
        request.triggered_at = Some(Utc::now());
        Ok(true)
    }
}

fn no_conflict(state: &State, request: &Request) -> bool {
    let held: Vec<_> = state
        .requests
        .values()
        .filter(|r| r.id != request.id && r.target_id == request.target_id)
        .filter(|r| RequestState::from_id(r.state_id).is_some_and(|s| s.holds_lock()))
        .map(lock_key)
        .collect();
    is_lock_available(&lock_key(request), &held)
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn find_target(&self, id: DbId) -> Result<Option<Target>, StoreError> {
        Ok(self.state.lock().unwrap().targets.get(&id).cloned())
    }

    async fn list_virtual_envs(&self, target_id: DbId) -> Result<Vec<VirtualEnv>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut envs: Vec<VirtualEnv> = state
            .virtual_envs
            .values()
            .filter(|e| e.target_id == target_id)
            .cloned()
            .collect();
        envs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(envs)
    }

    async fn list_installed_libraries(
        &self,
        virtual_env_id: DbId,
    ) -> Result<Vec<InstalledLibrary>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut libs: Vec<InstalledLibrary> = state
            .libraries
            .values()
            .filter(|l| l.virtual_environment_id == virtual_env_id)
            .cloned()
            .collect();
        libs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(libs)
    }

    async fn replace_installed_libraries(
        &self,
        target_id: DbId,
        env_name: &str,
        libraries: &[InstalledLibraryInfo],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let env_id = state.ensure_env(target_id, env_name);
        state
            .libraries
            .retain(|_, lib| lib.virtual_environment_id != env_id);
        for library in libraries {
            let id = state.next_id();
            state.libraries.insert(
                id,
                InstalledLibrary {
                    id,
                    virtual_environment_id: env_id,
                    name: library.name.clone(),
                    version: library.version.clone(),
                    created_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn replace_virtual_envs(
        &self,
        target_id: DbId,
        names: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let stale: Vec<DbId> = state
            .virtual_envs
            .values()
            .filter(|e| e.target_id == target_id && !names.contains(&e.name))
            .map(|e| e.id)
            .collect();
        for env_id in stale {
            state.remove_env(env_id);
        }
        for name in names {
            state.ensure_env(target_id, name);
        }
        Ok(())
    }

    async fn delete_virtual_env(&self, target_id: DbId, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let env_id = state
            .virtual_envs
            .values()
            .find(|e| e.target_id == target_id && e.name == name)
            .map(|e| e.id);
        match env_id {
            Some(env_id) => {
                state.remove_env(env_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_all_virtual_envs(&self, target_id: DbId) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<DbId> = state
            .virtual_envs
            .values()
            .filter(|e| e.target_id == target_id)
            .map(|e| e.id)
            .collect();
        for env_id in &ids {
            state.remove_env(*env_id);
        }
        Ok(ids.len() as u64)
    }

    async fn apply_initialization(
        &self,
        plan: &InitializationPlan,
    ) -> Result<Vec<Request>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let target = state
            .targets
            .get_mut(&plan.target_id)
            .ok_or(StoreError::NotFound {
                entity: "target",
                id: plan.target_id,
            })?;
        if let Some(version) = &plan.python_version {
            target.python_version = Some(version.clone());
        }
        for name in &plan.ensure_virtual_envs {
            state.ensure_env(plan.target_id, name);
        }
        Ok(plan
            .follow_ups
            .iter()
            .map(|follow_up| state.insert_request(follow_up, true))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Playbook fixtures
// ---------------------------------------------------------------------------

/// Write `script` as the playbook for `kind`.
///
/// See [`shell_config`] for how the script is run. Inside it, `$2` holds the
/// `--extra-vars` JSON.
pub fn write_playbook(dir: &Path, kind: RequestKind, script: &str) {
    let path = dir.join(format!("{}.yml", playbook_name(kind)));
    std::fs::write(path, script).expect("write playbook");
}

/// Configuration that runs playbooks from `dir` through `sh`.
///
/// The configured arguments turn the invocation into
/// `sh -c '<source last arg>' drover --extra-vars <json> ... <playbook>`, so
/// the playbook file itself is sourced as a shell script.
pub fn shell_config(dir: &Path) -> ExecutionConfig {
    ExecutionConfig {
        playbook: PlaybookConfig {
            execution_command: "sh".to_string(),
            playbook_arguments: vec![
                "-c".to_string(),
                r#"for last; do :; done; . "$last""#.to_string(),
                "drover".to_string(),
            ],
            playbooks_directory: dir.to_path_buf(),
            ..PlaybookConfig::default()
        },
        timeout: Duration::from_secs(20),
        ..ExecutionConfig::default()
    }
}

/// Poll `check` until it returns `true` or five seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within five seconds"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
