//! Execution configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;

/// Upper bound for `EXECUTION_TIMEOUT_SECS` (one week).
pub const MAX_EXECUTION_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Settings consumed by the command builder.
#[derive(Debug, Clone)]
pub struct PlaybookConfig {
    /// Executable that runs playbooks (default: `ansible-playbook`).
    pub execution_command: String,
    /// Arguments placed right after the executable.
    pub playbook_arguments: Vec<String>,
    /// Directory holding one `<name>.yml` playbook per request kind.
    pub playbooks_directory: PathBuf,
    /// Value of `ANSIBLE_LIBRARY` for the child process, if any.
    pub ansible_library: Option<String>,
    /// Callback URL handed to playbooks.
    pub api_url: String,
    /// SSH private key used to reach targets.
    pub private_key_path: String,
    /// Public key identifier registered for targets.
    pub public_key_uuid: String,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            execution_command: "ansible-playbook".to_string(),
            playbook_arguments: Vec::new(),
            playbooks_directory: PathBuf::from("/usr/share/ansible-waldur/python_management"),
            ansible_library: None,
            api_url: "http://localhost:8000/api/".to_string(),
            private_key_path: "/etc/drover/id_rsa".to_string(),
            public_key_uuid: String::new(),
        }
    }
}

/// Worker-wide execution configuration.
///
/// All fields have defaults suitable for local development; only
/// `DATABASE_URL` is read separately by the binary.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub playbook: PlaybookConfig,
    /// Wall-clock limit for one playbook run.
    pub timeout: Duration,
    /// Chunk size for bulk writes of list-shaped results.
    pub sync_batch_size: usize,
    /// Maximum number of requests processed concurrently.
    pub worker_concurrency: usize,
    /// How often the worker polls for triggered requests.
    pub poll_interval: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            playbook: PlaybookConfig::default(),
            timeout: Duration::from_secs(3600),
            sync_batch_size: 300,
            worker_concurrency: 8,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl ExecutionConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                                        |
    /// |------------------------------|------------------------------------------------|
    /// | `PLAYBOOK_EXECUTION_COMMAND` | `ansible-playbook`                             |
    /// | `PLAYBOOK_ARGUMENTS`         | empty (whitespace separated)                   |
    /// | `PLAYBOOKS_DIRECTORY`        | `/usr/share/ansible-waldur/python_management`  |
    /// | `ANSIBLE_LIBRARY`            | unset                                          |
    /// | `API_URL`                    | `http://localhost:8000/api/`                   |
    /// | `PRIVATE_KEY_PATH`           | `/etc/drover/id_rsa`                           |
    /// | `PUBLIC_KEY_UUID`            | empty                                          |
    /// | `EXECUTION_TIMEOUT_SECS`     | `3600`                                         |
    /// | `SYNC_BATCH_SIZE`            | `300`                                          |
    /// | `WORKER_CONCURRENCY`         | `8`                                            |
    /// | `POLL_INTERVAL_MS`           | `1000`                                         |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();
        let playbook_defaults = defaults.playbook;

        let playbook = PlaybookConfig {
            execution_command: lookup("PLAYBOOK_EXECUTION_COMMAND")
                .unwrap_or(playbook_defaults.execution_command),
            playbook_arguments: lookup("PLAYBOOK_ARGUMENTS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(playbook_defaults.playbook_arguments),
            playbooks_directory: lookup("PLAYBOOKS_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(playbook_defaults.playbooks_directory),
            ansible_library: lookup("ANSIBLE_LIBRARY").filter(|s| !s.is_empty()),
            api_url: lookup("API_URL").unwrap_or(playbook_defaults.api_url),
            private_key_path: lookup("PRIVATE_KEY_PATH")
                .unwrap_or(playbook_defaults.private_key_path),
            public_key_uuid: lookup("PUBLIC_KEY_UUID").unwrap_or(playbook_defaults.public_key_uuid),
        };

        let timeout_secs = parse_var(&lookup, "EXECUTION_TIMEOUT_SECS", defaults.timeout.as_secs())?;
        let sync_batch_size = parse_var(&lookup, "SYNC_BATCH_SIZE", defaults.sync_batch_size)?;
        let worker_concurrency =
            parse_var(&lookup, "WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        let poll_interval_ms = parse_var(
            &lookup,
            "POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;

        if timeout_secs == 0 || timeout_secs > MAX_EXECUTION_TIMEOUT_SECS {
            return Err(CoreError::Validation(format!(
                "EXECUTION_TIMEOUT_SECS must be between 1 and {MAX_EXECUTION_TIMEOUT_SECS}"
            )));
        }
        if poll_interval_ms == 0 {
            return Err(CoreError::Validation(
                "POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if sync_batch_size == 0 {
            return Err(CoreError::Validation(
                "SYNC_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }
        if worker_concurrency == 0 {
            return Err(CoreError::Validation(
                "WORKER_CONCURRENCY must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            playbook,
            timeout: Duration::from_secs(timeout_secs),
            sync_batch_size,
            worker_concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} must be a valid number, got \"{raw}\""))),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
