// Configuration sources: the server URL (environment override with a
// baked-in default) and the per-project `skiff.yml` file in the working
// directory.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::{ClientError, Result};

pub const DEFAULT_SERVER_URL: &str = "https://api.skiffdata.com";

/// Name of the project config file looked up in the working directory.
pub const PROJECT_FILE: &str = "skiff.yml";

/// Environment variable consulted when `skiff.yml` does not name a project.
pub const PROJECT_ENV: &str = "SKIFF_PROJECT";

/// Environment variable that points the client at a different server.
pub const SERVER_URL_ENV: &str = "SKIFF_SERVER_URL";

/// The server URL this invocation talks to.
pub fn server_url() -> String {
    env::var(SERVER_URL_ENV).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string())
}

/// Host part of the server URL. Credential entries are keyed by host, not
/// by the full URL.
pub fn host_name(server_url: &str) -> Result<String> {
    let url = Url::parse(server_url)
        .map_err(|e| ClientError::Config(format!("invalid server URL {server_url:?}: {e}")))?;
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::Config(format!("server URL {server_url:?} has no host")))
}

/// Contents of `skiff.yml`. Both keys are optional in the file itself;
/// resolution decides whether enough information is present.
#[derive(Debug, Default, Deserialize)]
pub struct ProjectFile {
    pub project: Option<String>,
    pub runtime: Option<String>,
}

impl ProjectFile {
    /// Reads the config file at `path`, or `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<ProjectFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        let parsed = serde_yaml::from_str(&text)
            .map_err(|e| ClientError::Config(format!("invalid {}: {}", path.display(), e)))?;
        Ok(Some(parsed))
    }
}

/// Resolves the (project name, runtime) pair from the config file and the
/// environment. The file's `project` key wins, then the environment
/// variable; if neither is present the caller gets a config error telling
/// them how to fix it.
pub fn resolve_project(
    file: Option<&ProjectFile>,
    env_project: Option<String>,
) -> Result<(String, Option<String>)> {
    let runtime = file.and_then(|f| f.runtime.clone());
    let name = file
        .and_then(|f| f.project.clone())
        .or_else(|| env_project.filter(|v| !v.is_empty()));
    match name {
        Some(name) => Ok((name, runtime)),
        None => Err(ClientError::Config(format!(
            "no project configured: add a `project` key to {PROJECT_FILE} or set {PROJECT_ENV}"
        ))),
    }
}
