//! Request kinds, lifecycle states, and kind-specific payloads.
//!
//! A request is one unit of orchestrated work against a target. Its kind is a
//! closed set: every per-kind behaviour (playbook, extra vars, output markers,
//! reconciliation) is selected by an exhaustive `match` on [`RequestKind`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Allowed characters for virtual environment names.
pub const VIRTUAL_ENV_NAME_PATTERN: &str = r"^[a-zA-Z0-9\-_]+$";

/// Allowed characters for installed library names (dots appear in names
/// such as `zope.interface`).
pub const LIBRARY_NAME_PATTERN: &str = r"^[a-zA-Z0-9\-_.]+$";

/// Maximum length of a virtual environment or library name.
pub const MAX_NAME_LEN: usize = 255;

static VIRTUAL_ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(VIRTUAL_ENV_NAME_PATTERN).expect("valid regex"));

static LIBRARY_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(LIBRARY_NAME_PATTERN).expect("valid regex"));

// ---------------------------------------------------------------------------
// RequestKind
// ---------------------------------------------------------------------------

/// What a request asks the target to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Install the python environment on the target.
    Initialize,
    /// Install and remove libraries in one virtual environment.
    Synchronize,
    /// Discover the virtual environments present on the target.
    FindVirtualEnvs,
    /// Discover the libraries installed in one virtual environment.
    FindInstalledLibraries,
    /// Remove one virtual environment.
    DeleteVirtualEnv,
    /// Remove the whole python environment from the target.
    Delete,
}

impl RequestKind {
    /// Every kind, in declaration order.
    pub const ALL: [RequestKind; 6] = [
        RequestKind::Initialize,
        RequestKind::Synchronize,
        RequestKind::FindVirtualEnvs,
        RequestKind::FindInstalledLibraries,
        RequestKind::DeleteVirtualEnv,
        RequestKind::Delete,
    ];

    /// Name stored in the `requests.kind` column.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Initialize => "initialize",
            RequestKind::Synchronize => "synchronize",
            RequestKind::FindVirtualEnvs => "find_virtual_envs",
            RequestKind::FindInstalledLibraries => "find_installed_libraries",
            RequestKind::DeleteVirtualEnv => "delete_virtual_env",
            RequestKind::Delete => "delete",
        }
    }

    /// Whether the kind operates on a single virtual environment.
    ///
    /// Scoped kinds must carry a scope name; whole-target kinds must not.
    pub fn requires_scope(self) -> bool {
        match self {
            RequestKind::Synchronize
            | RequestKind::FindInstalledLibraries
            | RequestKind::DeleteVirtualEnv => true,
            RequestKind::Initialize | RequestKind::FindVirtualEnvs | RequestKind::Delete => false,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown request kind: {s}")))
    }
}

// ---------------------------------------------------------------------------
// RequestState
// ---------------------------------------------------------------------------

/// Request lifecycle state.
///
/// Discriminants match the `request_states` seed data.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending = 1,
    Scheduled = 2,
    Running = 3,
    Succeeded = 4,
    Failed = 5,
}

impl RequestState {
    /// States in which a request holds its lock.
    pub const LOCKING: [RequestState; 2] = [RequestState::Scheduled, RequestState::Running];

    /// Return the database state ID.
    pub fn id(self) -> i16 {
        self as i16
    }

    /// Map a database state ID back to a state.
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Self::Pending),
            2 => Some(Self::Scheduled),
            3 => Some(Self::Running),
            4 => Some(Self::Succeeded),
            5 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Human readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// `true` for Scheduled and Running.
    pub fn holds_lock(self) -> bool {
        Self::LOCKING.contains(&self)
    }

    /// `true` for Succeeded and Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Transitions only move forward; terminal states have no successors.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Scheduled)
                | (Self::Scheduled, Self::Running)
                | (Self::Scheduled, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of a `synchronize` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub libraries_to_install: Vec<String>,
    #[serde(default)]
    pub libraries_to_remove: Vec<String>,
}

/// A virtual environment the operator wants to exist after initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredVirtualEnv {
    pub name: String,
    #[serde(default)]
    pub libraries_to_install: Vec<String>,
}

/// Payload of an `initialize` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializePayload {
    #[serde(default)]
    pub virtual_environments: Vec<DesiredVirtualEnv>,
}

/// Typed view over a request's JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Initialize(InitializePayload),
    Synchronize(SyncPayload),
    Empty,
}

impl RequestPayload {
    /// Decode `value` according to `kind`.
    ///
    /// `null` is accepted as an empty payload for every kind.
    pub fn parse(kind: RequestKind, value: &serde_json::Value) -> Result<Self, CoreError> {
        let value = if value.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            value.clone()
        };
        match kind {
            RequestKind::Initialize => serde_json::from_value(value)
                .map(RequestPayload::Initialize)
                .map_err(|e| CoreError::Validation(format!("Invalid initialize payload: {e}"))),
            RequestKind::Synchronize => serde_json::from_value(value)
                .map(RequestPayload::Synchronize)
                .map_err(|e| CoreError::Validation(format!("Invalid synchronize payload: {e}"))),
            RequestKind::FindVirtualEnvs
            | RequestKind::FindInstalledLibraries
            | RequestKind::DeleteVirtualEnv
            | RequestKind::Delete => Ok(RequestPayload::Empty),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a virtual environment name.
pub fn validate_virtual_env_name(name: &str) -> Result<(), CoreError> {
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Virtual environment name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !VIRTUAL_ENV_NAME_RE.is_match(name) {
        return Err(CoreError::Validation(format!(
            "Virtual environment name has invalid format: \"{name}\""
        )));
    }
    Ok(())
}

/// Validate an installed library name.
pub fn validate_library_name(name: &str) -> Result<(), CoreError> {
    if name.len() > MAX_NAME_LEN || !LIBRARY_NAME_RE.is_match(name) {
        return Err(CoreError::Validation(format!(
            "Library name has invalid format: \"{name}\""
        )));
    }
    Ok(())
}

/// Validate a library specification such as `requests==2.0`.
///
/// Specs are passed to pip verbatim, so only emptiness and whitespace are
/// rejected here.
pub fn validate_library_spec(spec: &str) -> Result<(), CoreError> {
    if spec.is_empty() || spec.chars().any(char::is_whitespace) {
        return Err(CoreError::Validation(format!(
            "Library specification is invalid: \"{spec}\""
        )));
    }
    Ok(())
}

/// Check the scope against the kind's scope rule and the name format.
pub fn validate_scope(kind: RequestKind, scope_name: Option<&str>) -> Result<(), CoreError> {
    match (kind.requires_scope(), scope_name) {
        (true, Some(name)) => validate_virtual_env_name(name),
        (true, None) => Err(CoreError::Validation(format!(
            "Request kind '{kind}' requires a virtual environment name"
        ))),
        (false, Some(_)) => Err(CoreError::Validation(format!(
            "Request kind '{kind}' applies to the whole target and takes no virtual environment name"
        ))),
        (false, None) => Ok(()),
    }
}

/// Validate the decoded payload's contents.
pub fn validate_payload(payload: &RequestPayload) -> Result<(), CoreError> {
    match payload {
        RequestPayload::Synchronize(sync) => sync
            .libraries_to_install
            .iter()
            .chain(&sync.libraries_to_remove)
            .try_for_each(|spec| validate_library_spec(spec)),
        RequestPayload::Initialize(init) => {
            let mut seen = std::collections::HashSet::new();
            for env in &init.virtual_environments {
                validate_virtual_env_name(&env.name)?;
                if !seen.insert(env.name.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "Duplicate virtual environment: \"{}\"",
                        env.name
                    )));
                }
                env.libraries_to_install
                    .iter()
                    .try_for_each(|spec| validate_library_spec(spec))?;
            }
            Ok(())
        }
        RequestPayload::Empty => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
