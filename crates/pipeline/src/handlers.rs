//! Reconciliation of extracted facts into persisted state.
//!
//! [`handle`] runs once per request, after the playbook exited successfully.
//! Every handler validates all extracted data before its first write, so a
//! rejected result leaves the inventory untouched.

use std::collections::{BTreeMap, BTreeSet};

use drover_core::markers::{ExtractedInfo, InstalledLibraryInfo};
use drover_core::request::{
    validate_library_name, validate_virtual_env_name, RequestKind, RequestPayload,
};
use drover_core::types::DbId;
use drover_db::models::initialization::InitializationPlan;
use drover_db::models::request::{CreateRequest, Request};

use crate::error::ExecutionError;
use crate::store::Store;

/// Persist `extracted` for `request` and return any follow-up requests.
pub async fn handle(
    store: &dyn Store,
    request: &Request,
    kind: RequestKind,
    extracted: ExtractedInfo,
) -> Result<Vec<Request>, ExecutionError> {
    match (kind, extracted) {
        (
            RequestKind::Synchronize | RequestKind::FindInstalledLibraries,
            ExtractedInfo::InstalledLibraries { libraries },
        ) => {
            let env_name = require_scope(request)?;
            let libraries = normalize_libraries(libraries)?;
            store
                .replace_installed_libraries(request.target_id, env_name, &libraries)
                .await?;
            tracing::info!(
                request_id = request.id,
                scope = env_name,
                count = libraries.len(),
                "Installed libraries reconciled",
            );
            Ok(Vec::new())
        }
        (RequestKind::FindVirtualEnvs, ExtractedInfo::VirtualEnvironments { names }) => {
            let names = normalize_virtual_envs(names)?;
            store.replace_virtual_envs(request.target_id, &names).await?;
            tracing::info!(
                request_id = request.id,
                target_id = request.target_id,
                count = names.len(),
                "Virtual environments reconciled",
            );
            Ok(Vec::new())
        }
        (RequestKind::Initialize, ExtractedInfo::Initialization { python_version }) => {
            let plan = plan_initialization(store, request, python_version).await?;
            let follow_ups = store.apply_initialization(&plan).await?;
            tracing::info!(
                request_id = request.id,
                target_id = request.target_id,
                follow_ups = follow_ups.len(),
                "Initialization recorded",
            );
            Ok(follow_ups)
        }
        (RequestKind::DeleteVirtualEnv, ExtractedInfo::Null) => {
            let env_name = require_scope(request)?;
            let removed = store
                .delete_virtual_env(request.target_id, env_name)
                .await?;
            tracing::info!(request_id = request.id, scope = env_name, removed, "Virtual environment deleted");
            Ok(Vec::new())
        }
        (RequestKind::Delete, ExtractedInfo::Null) => {
            let removed = store.delete_all_virtual_envs(request.target_id).await?;
            tracing::info!(
                request_id = request.id,
                target_id = request.target_id,
                removed,
                "Python environment deleted",
            );
            Ok(Vec::new())
        }
        (kind, extracted) => Err(ExecutionError::Extraction(format!(
            "Unexpected extraction result for '{kind}': {extracted:?}"
        ))),
    }
}

fn require_scope(request: &Request) -> Result<&str, ExecutionError> {
    request.scope().ok_or_else(|| {
        ExecutionError::Extraction(format!(
            "Request {} has no virtual environment name",
            request.id
        ))
    })
}

/// Validate names and collapse exact duplicates, sorted by name.
///
/// The same library reported with two different versions is rejected.
pub fn normalize_libraries(
    libraries: Vec<InstalledLibraryInfo>,
) -> Result<Vec<InstalledLibraryInfo>, ExecutionError> {
    let mut by_name: BTreeMap<String, String> = BTreeMap::new();
    for library in libraries {
        validate_library_name(&library.name)
            .map_err(|e| ExecutionError::Extraction(e.to_string()))?;
        match by_name.get(&library.name) {
            Some(version) if *version != library.version => {
                return Err(ExecutionError::Extraction(format!(
                    "Library \"{}\" reported with conflicting versions {} and {}",
                    library.name, version, library.version
                )));
            }
            Some(_) => {}
            None => {
                by_name.insert(library.name, library.version);
            }
        }
    }
    Ok(by_name
        .into_iter()
        .map(|(name, version)| InstalledLibraryInfo { name, version })
        .collect())
}

/// Validate names and collapse duplicates, sorted by name.
pub fn normalize_virtual_envs(names: Vec<String>) -> Result<Vec<String>, ExecutionError> {
    let mut unique = BTreeSet::new();
    for name in names {
        validate_virtual_env_name(&name).map_err(|e| ExecutionError::Extraction(e.to_string()))?;
        unique.insert(name);
    }
    Ok(unique.into_iter().collect())
}

/// Compute what an initialization writes.
///
/// One synchronize follow-up is planned per environment known after the run:
/// the target's existing ones plus those the payload asks for. A follow-up
/// installs the payload's libraries for that environment, or re-pins the
/// environment's currently recorded libraries.
async fn plan_initialization(
    store: &dyn Store,
    request: &Request,
    python_version: Option<String>,
) -> Result<InitializationPlan, ExecutionError> {
    let desired = match request.parsed_payload()? {
        RequestPayload::Initialize(payload) => payload.virtual_environments,
        _ => Vec::new(),
    };
    for env in &desired {
        validate_virtual_env_name(&env.name)
            .map_err(|e| ExecutionError::Extraction(e.to_string()))?;
    }

    let mut libraries_by_env: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for env in store.list_virtual_envs(request.target_id).await? {
        let libraries = store
            .list_installed_libraries(env.id)
            .await?
            .iter()
            .map(|library| library.requirement())
            .collect();
        libraries_by_env.insert(env.name, libraries);
    }
    for env in &desired {
        libraries_by_env.insert(env.name.clone(), env.libraries_to_install.clone());
    }

    let follow_ups = libraries_by_env
        .into_iter()
        .map(|(name, libraries_to_install)| {
            synchronize_follow_up(request.target_id, request.id, name, libraries_to_install)
        })
        .collect();

    Ok(InitializationPlan {
        target_id: request.target_id,
        python_version,
        ensure_virtual_envs: desired.into_iter().map(|env| env.name).collect(),
        follow_ups,
    })
}

fn synchronize_follow_up(
    target_id: DbId,
    parent_id: DbId,
    env_name: String,
    libraries_to_install: Vec<String>,
) -> CreateRequest {
    let payload = serde_json::json!({
        "libraries_to_install": libraries_to_install,
        "libraries_to_remove": [],
    });
    CreateRequest {
        target_id,
        kind: RequestKind::Synchronize,
        scope_name: Some(env_name),
        payload,
        parent_request_id: Some(parent_id),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
