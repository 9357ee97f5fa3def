//! Batch planning
//!
//! Expands a local file or directory into one [`JobRequest`] per file.
//!
//! - Names starting with `.` are skipped unless hidden files are included
//! - Ignore patterns are regexes searched against each file or directory
//!   name (not the full path); an ignored directory prunes its subtree
//! - By default the directory's own name is kept on the remote side
//!   (`photos/2024/a.jpg` -> `<remote>/photos/2024/a.jpg`); with
//!   `contents_only` it is dropped (`<remote>/2024/a.jpg`)
//! - Remote paths always use `/`, whatever the local separator

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use uplink_core::{ConnectionParams, JobRequest, Protocol};

/// Filtering and layout options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanOptions {
    /// Regexes matched against file and directory names
    pub ignore_patterns: Vec<String>,
    pub include_hidden: bool,
    /// Upload what is inside the directory, not the directory itself
    pub contents_only: bool,
}

/// A local file or directory to upload under `remote_dir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRequest {
    pub local_path: PathBuf,
    pub remote_dir: String,
    pub protocol: Protocol,
    pub connection_params: ConnectionParams,
    pub account_id: String,
    #[serde(default)]
    pub options: PlanOptions,
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("{0} does not exist")]
    NotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of expanding a request
#[derive(Debug, Clone, Default)]
pub struct UploadPlan {
    pub requests: Vec<JobRequest>,
    /// Files and directories left out by the filters
    pub skipped: usize,
    /// Entries that could not be read
    pub errors: usize,
    /// Patterns that failed to compile and were ignored
    pub invalid_patterns: Vec<String>,
}

impl UploadPlan {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

struct Filter {
    patterns: Vec<Regex>,
    include_hidden: bool,
}

impl Filter {
    fn new(options: &PlanOptions, invalid: &mut Vec<String>) -> Self {
        let patterns = options
            .ignore_patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Invalid ignore pattern {:?}: {}", p, e);
                    invalid.push(p.to_string());
                    None
                }
            })
            .collect();
        Self {
            patterns,
            include_hidden: options.include_hidden,
        }
    }

    fn ignores(&self, name: &OsStr) -> bool {
        let name = name.to_string_lossy();
        if !self.include_hidden && name.starts_with('.') {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(&name))
    }
}

/// Join a remote directory and a relative local path with `/`
fn remote_join(remote_dir: &str, relative: &Path) -> String {
    let mut remote = remote_dir.trim_end_matches(['/', '\\']).replace('\\', "/");
    for component in relative.components() {
        if !remote.is_empty() || remote_dir.starts_with('/') {
            remote.push('/');
        }
        remote.push_str(&component.as_os_str().to_string_lossy());
    }
    remote
}

/// Expand one request into per-file job requests
pub fn plan(request: &DirectoryRequest) -> Result<UploadPlan, PlanError> {
    let root = &request.local_path;
    let meta = std::fs::metadata(root).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PlanError::NotFound(root.clone()),
        _ => PlanError::Io {
            path: root.clone(),
            source: e,
        },
    })?;

    let mut plan = UploadPlan::default();
    let filter = Filter::new(&request.options, &mut plan.invalid_patterns);
    let job = |local: PathBuf, remote: String| {
        JobRequest::new(
            local,
            remote,
            request.protocol,
            request.connection_params.clone(),
            request.account_id.clone(),
        )
    };

    let name = root.file_name().unwrap_or_else(|| root.as_os_str());
    if filter.ignores(name) {
        debug!("Ignoring {:?}", root);
        plan.skipped += 1;
        return Ok(plan);
    }

    if meta.is_file() {
        let remote = remote_join(&request.remote_dir, Path::new(name));
        plan.requests.push(job(root.clone(), remote));
        return Ok(plan);
    }

    // Remote paths are relative to this base
    let base = if request.options.contents_only {
        root.as_path()
    } else {
        root.parent().unwrap_or(root.as_path())
    };

    let mut skipped = 0;
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let ignored = filter.ignores(entry.file_name());
            if ignored {
                skipped += 1;
            }
            !ignored
        });

    let mut requests = Vec::new();
    let mut errors = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
        let remote = remote_join(&request.remote_dir, relative);
        requests.push(job(entry.path().to_path_buf(), remote));
    }

    plan.requests = requests;
    plan.skipped = skipped;
    plan.errors = errors;
    info!(
        "Planned {} file(s) from {:?} ({} skipped)",
        plan.requests.len(),
        root,
        plan.skipped
    );
    Ok(plan)
}

/// Expand several requests into one batch
pub fn plan_all(requests: &[DirectoryRequest]) -> Result<UploadPlan, PlanError> {
    let mut combined = UploadPlan::default();
    for request in requests {
        let plan = plan(request)?;
        combined.requests.extend(plan.requests);
        combined.skipped += plan.skipped;
        combined.errors += plan.errors;
        for pattern in plan.invalid_patterns {
            if !combined.invalid_patterns.contains(&pattern) {
                combined.invalid_patterns.push(pattern);
            }
        }
    }
    Ok(combined)
}
