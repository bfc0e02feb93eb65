//! Playbook command construction.
//!
//! [`CommandBuilder::build`] turns a request (kind, scope, payload) plus the
//! target's connection attributes into a fully resolved [`CommandSpec`].
//! Building is deterministic: the extra-vars bundle is serialized from a
//! sorted map, so identical input always yields identical bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::config::PlaybookConfig;
use crate::request::{RequestKind, RequestPayload};

/// SSH options appended to every invocation. Targets are ephemeral or get
/// re-imaged, so host keys are neither persisted nor checked.
pub const SSH_COMMON_ARGS: &str = "-o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

/// Image-name substring to default login account, checked in order.
const DEFAULT_SYSTEM_USERS: &[(&str, &str)] = &[
    ("debian", "debian"),
    ("ubuntu", "ubuntu"),
    ("centos", "centos"),
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Fully resolved external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub executable: String,
    pub arguments: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

impl CommandSpec {
    /// Single-line rendering used in log messages.
    pub fn display_line(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Connection attributes of the target a request acts upon.
#[derive(Debug, Clone)]
pub struct TargetAttributes {
    pub uuid: uuid::Uuid,
    pub address: String,
    /// OS image name, e.g. `debian-9-x86_64`.
    pub image_name: String,
    pub credential_ref: String,
    pub virtual_envs_dir_path: String,
}

/// Request data the builder needs.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub kind: RequestKind,
    pub scope_name: Option<&'a str>,
    pub payload: &'a RequestPayload,
}

/// Errors raised before any process is started.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Playbook {} does not exist.", .0.display())]
    PlaybookMissing(PathBuf),

    #[error("Cannot find default user for the installed image '{0}'")]
    UnsupportedPlatform(String),

    #[error("Request kind '{0}' requires a virtual environment name")]
    MissingScope(RequestKind),

    #[error("Failed to serialize extra vars: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Per-kind tables
// ---------------------------------------------------------------------------

/// Playbook file stem for each request kind.
pub fn playbook_name(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Initialize => "install_python_environment",
        RequestKind::Synchronize => "synchronize_packages",
        RequestKind::FindVirtualEnvs => "find_installed_virtual_environments",
        RequestKind::FindInstalledLibraries => "find_installed_libraries_for_virtual_environment",
        RequestKind::DeleteVirtualEnv => "delete_virtual_environment",
        RequestKind::Delete => "delete_python_environment",
    }
}

/// Resolve the login account for an OS image name.
pub fn default_system_user(image_name: &str) -> Result<&'static str, CommandError> {
    let lowered = image_name.to_lowercase();
    DEFAULT_SYSTEM_USERS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, user)| *user)
        .ok_or_else(|| CommandError::UnsupportedPlatform(image_name.to_string()))
}

fn kind_extra_vars(
    request: CommandRequest<'_>,
) -> Result<BTreeMap<String, Value>, CommandError> {
    let mut vars = BTreeMap::new();
    match request.kind {
        RequestKind::Synchronize => {
            let scope = request
                .scope_name
                .ok_or(CommandError::MissingScope(request.kind))?;
            let (install, remove) = match request.payload {
                RequestPayload::Synchronize(sync) => (
                    sync.libraries_to_install.clone(),
                    sync.libraries_to_remove.clone(),
                ),
                _ => (Vec::new(), Vec::new()),
            };
            vars.insert("libraries_to_install".to_string(), json!(install));
            vars.insert("libraries_to_remove".to_string(), json!(remove));
            vars.insert("virtual_env_name".to_string(), json!(scope));
        }
        RequestKind::FindInstalledLibraries | RequestKind::DeleteVirtualEnv => {
            let scope = request
                .scope_name
                .ok_or(CommandError::MissingScope(request.kind))?;
            vars.insert("virtual_env_name".to_string(), json!(scope));
        }
        RequestKind::Initialize | RequestKind::FindVirtualEnvs | RequestKind::Delete => {}
    }
    Ok(vars)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds playbook invocations from requests.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    config: PlaybookConfig,
}

impl CommandBuilder {
    pub fn new(config: PlaybookConfig) -> Self {
        Self { config }
    }

    /// Path of the playbook for `kind` inside the configured directory.
    pub fn playbook_path(&self, kind: RequestKind) -> PathBuf {
        self.config
            .playbooks_directory
            .join(format!("{}.yml", playbook_name(kind)))
    }

    /// Build the invocation for `request` against `target`.
    ///
    /// Fails with [`CommandError::PlaybookMissing`] when the playbook file is
    /// absent, without deferring to the process's exit code.
    pub fn build(
        &self,
        request: CommandRequest<'_>,
        target: &TargetAttributes,
    ) -> Result<CommandSpec, CommandError> {
        let playbook_path = self.playbook_path(request.kind);
        ensure_playbook_exists(&playbook_path)?;

        let extra_vars = self.build_extra_vars(request, target)?;

        let mut arguments = self.config.playbook_arguments.clone();
        arguments.push("--extra-vars".to_string());
        arguments.push(extra_vars);
        arguments.push("--ssh-common-args".to_string());
        arguments.push(SSH_COMMON_ARGS.to_string());
        arguments.push(playbook_path.to_string_lossy().into_owned());

        let mut environment = BTreeMap::new();
        if let Some(library) = &self.config.ansible_library {
            environment.insert("ANSIBLE_LIBRARY".to_string(), library.clone());
        }
        environment.insert("ANSIBLE_HOST_KEY_CHECKING".to_string(), "False".to_string());

        Ok(CommandSpec {
            executable: self.config.execution_command.clone(),
            arguments,
            environment,
            working_directory: Some(self.config.playbooks_directory.clone()),
        })
    }

    /// Serialize common and kind-specific vars into the `--extra-vars` JSON.
    ///
    /// Kind-specific vars win on key collisions.
    pub fn build_extra_vars(
        &self,
        request: CommandRequest<'_>,
        target: &TargetAttributes,
    ) -> Result<String, CommandError> {
        let mut vars = self.common_extra_vars(target)?;
        vars.extend(kind_extra_vars(request)?);
        Ok(serde_json::to_string(&vars)?)
    }

    fn common_extra_vars(
        &self,
        target: &TargetAttributes,
    ) -> Result<BTreeMap<String, Value>, CommandError> {
        let system_user = default_system_user(&target.image_name)?;
        Ok(BTreeMap::from([
            ("api_url".to_string(), json!(self.config.api_url)),
            ("credential_ref".to_string(), json!(target.credential_ref)),
            ("private_key_path".to_string(), json!(self.config.private_key_path)),
            ("public_key_uuid".to_string(), json!(self.config.public_key_uuid)),
            ("default_system_user".to_string(), json!(system_user)),
            ("instance_uuid".to_string(), json!(target.uuid.simple().to_string())),
            ("instance_address".to_string(), json!(target.address)),
            (
                "virtual_envs_dir_path".to_string(),
                json!(target.virtual_envs_dir_path),
            ),
        ]))
    }
}

fn ensure_playbook_exists(path: &Path) -> Result<(), CommandError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CommandError::PlaybookMissing(path.to_path_buf()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
