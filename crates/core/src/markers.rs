//! Extraction of structured facts from playbook output.
//!
//! Playbooks print marker tokens, usually inside an ansible `"msg"` field:
//!
//! ```text
//! PYTHON_VERSION <version>
//! VIRTUAL_ENV <name>
//! INSTALLED <name> <version>
//! ```
//!
//! A [`PostProcessor`] is chosen per request kind, fed every output line,
//! and finally turned into an [`ExtractedInfo`]. Lines without a marker and
//! malformed markers are skipped.

use std::sync::LazyLock;

use regex::Regex;

use crate::request::RequestKind;

static PYTHON_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bPYTHON_VERSION\s+(\S+)").expect("valid regex"));

static VIRTUAL_ENV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bVIRTUAL_ENV\s+(\S+)").expect("valid regex"));

static INSTALLED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bINSTALLED\s+(\S+)\s+(\S+)").expect("valid regex"));

/// A library reported by an `INSTALLED` marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstalledLibraryInfo {
    pub name: String,
    pub version: String,
}

/// Facts gathered from one run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedInfo {
    Initialization { python_version: Option<String> },
    InstalledLibraries { libraries: Vec<InstalledLibraryInfo> },
    VirtualEnvironments { names: Vec<String> },
    Null,
}

/// Per-kind line consumer accumulating [`ExtractedInfo`].
#[derive(Debug, Clone)]
pub enum PostProcessor {
    Initialization { python_version: Option<String> },
    InstalledLibraries { libraries: Vec<InstalledLibraryInfo> },
    VirtualEnvironments { names: Vec<String> },
    Null,
}

impl PostProcessor {
    pub fn for_kind(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Initialize => PostProcessor::Initialization {
                python_version: None,
            },
            RequestKind::Synchronize | RequestKind::FindInstalledLibraries => {
                PostProcessor::InstalledLibraries {
                    libraries: Vec::new(),
                }
            }
            RequestKind::FindVirtualEnvs => PostProcessor::VirtualEnvironments { names: Vec::new() },
            RequestKind::DeleteVirtualEnv | RequestKind::Delete => PostProcessor::Null,
        }
    }

    pub fn post_process_line(&mut self, line: &str) {
        match self {
            PostProcessor::Initialization { python_version } => {
                if let Some(version) = capture(&PYTHON_VERSION_RE, line, 1) {
                    *python_version = Some(version);
                }
            }
            PostProcessor::InstalledLibraries { libraries } => {
                if let Some(library) = parse_installed(line) {
                    libraries.push(library);
                }
            }
            PostProcessor::VirtualEnvironments { names } => {
                if let Some(name) = capture(&VIRTUAL_ENV_RE, line, 1) {
                    names.push(name);
                }
            }
            PostProcessor::Null => {}
        }
    }

    pub fn into_extracted(self) -> ExtractedInfo {
        match self {
            PostProcessor::Initialization { python_version } => {
                ExtractedInfo::Initialization { python_version }
            }
            PostProcessor::InstalledLibraries { libraries } => {
                ExtractedInfo::InstalledLibraries { libraries }
            }
            PostProcessor::VirtualEnvironments { names } => {
                ExtractedInfo::VirtualEnvironments { names }
            }
            PostProcessor::Null => ExtractedInfo::Null,
        }
    }
}

fn parse_installed(line: &str) -> Option<InstalledLibraryInfo> {
    let caps = INSTALLED_RE.captures(line)?;
    let name = clean_token(caps.get(1)?.as_str())?;
    let version = clean_token(caps.get(2)?.as_str())?;
    Some(InstalledLibraryInfo { name, version })
}

fn capture(re: &Regex, line: &str, group: usize) -> Option<String> {
    let caps = re.captures(line)?;
    clean_token(caps.get(group)?.as_str())
}

/// Strip the quoting and separators ansible wraps around `msg` values.
fn clean_token(token: &str) -> Option<String> {
    let cleaned = token.trim_matches(|c| matches!(c, '"' | '\'' | ','));
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
