// The project handle: the primary domain object of the SDK. A project is
// just a name plus an optional runtime; its canonical state lives on the
// server, and every operation here is one RPC call with a little local
// pre- or post-processing.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::Client;
use crate::config::{self, ProjectFile};
use crate::error::{ClientError, Result};
use crate::jobs::{Job, JobSource, JobStatus, LogLine, RemoteTask};
use crate::models::{ModelImage, ModelRepository};
use crate::path::TransferPath;

pub struct Project {
    pub name: String,
    pub runtime: Option<String>,
    client: Client,
}

/// One row of a `volumes:ls` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeEntry {
    pub mode: String,
    pub size: u64,
    pub name: String,
}

impl Project {
    pub fn new(name: impl Into<String>, runtime: Option<String>) -> Result<Project> {
        Ok(Project {
            name: name.into(),
            runtime,
            client: Client::from_env()?,
        })
    }

    pub fn with_client(
        name: impl Into<String>,
        runtime: Option<String>,
        client: Client,
    ) -> Project {
        Project {
            name: name.into(),
            runtime,
            client,
        }
    }

    /// The project this working directory belongs to, from `skiff.yml`
    /// with the `SKIFF_PROJECT` fallback.
    pub fn current() -> Result<Project> {
        let file = ProjectFile::load(Path::new(config::PROJECT_FILE))?;
        let (name, runtime) =
            config::resolve_project(file.as_ref(), env::var(config::PROJECT_ENV).ok())?;
        Project::new(name, runtime)
    }

    /// All projects visible to the logged-in user.
    pub fn find_all() -> Result<Vec<Project>> {
        let client = Client::from_env()?;
        let response = client.call("projects", json!({}))?;
        let listed: Vec<ProjectListing> = serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected projects response: {e}")))?;
        Ok(listed
            .into_iter()
            .map(|p| Project::with_client(p.name, p.runtime, client.clone()))
            .collect())
    }

    /// Looks up one project by name; `None` when no such project exists.
    pub fn find(name: &str) -> Result<Option<Project>> {
        let client = Client::from_env()?;
        let response = client.call("get_project", json!({ "name": name }))?;
        if response.is_null() {
            return Ok(None);
        }
        let listed: ProjectListing = serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected project response: {e}")))?;
        Ok(Some(Project::with_client(
            listed.name,
            listed.runtime,
            client,
        )))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn create(&self) -> Result<Value> {
        let response = self.client.call("create", json!({ "name": self.name }))?;
        RemoteTask::resolve(&self.client, response)
    }

    pub fn delete(&self) -> Result<()> {
        self.client
            .call("delete", json!({ "project": self.name }))?;
        Ok(())
    }

    /// Starts `command` on a fresh instance and returns the created job.
    pub fn run(&self, command: &[String], instance_size: Option<&str>) -> Result<Job> {
        let mut params = json!({ "project": self.name, "command": command });
        if let Some(size) = instance_size {
            params["instance_size"] = size.into();
        }
        let response = self.client.call("run", params)?;
        job_from(response)
    }

    /// Starts a notebook session job.
    pub fn run_notebook(&self, instance_size: Option<&str>) -> Result<Job> {
        let mut params = json!({ "project": self.name });
        if let Some(size) = instance_size {
            params["instance_size"] = size.into();
        }
        let response = self.client.call("run_notebook", params)?;
        job_from(response)
    }

    pub fn stop(&self, jobid: &str) -> Result<()> {
        self.client
            .call("stop", json!({ "project": self.name, "jobid": jobid }))?;
        Ok(())
    }

    pub fn start(&self, service: &str) -> Result<()> {
        self.client
            .call("start", json!({ "project": self.name, "name": service }))?;
        Ok(())
    }

    pub fn restart(&self, service: &str) -> Result<()> {
        self.client
            .call("restart", json!({ "project": self.name, "name": service }))?;
        Ok(())
    }

    /// Jobs of this project; running ones only unless `all` is set.
    pub fn ps(&self, all: bool) -> Result<Vec<Job>> {
        let response = self
            .client
            .call("ps", json!({ "project": self.name, "all": all }))?;
        serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected ps response: {e}")))
    }

    pub fn get_job(&self, jobid: &str) -> Result<Job> {
        let response = self
            .client
            .call("ps", json!({ "project": self.name, "jobid": jobid }))?;
        job_from(response)
    }

    pub fn logs(&self, jobid: &str) -> Result<Vec<LogLine>> {
        let response = self
            .client
            .call("logs", json!({ "project": self.name, "jobid": jobid }))?;
        serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected logs response: {e}")))
    }

    pub fn get_config(&self) -> Result<BTreeMap<String, String>> {
        let response = self
            .client
            .call("get_config", json!({ "project": self.name }))?;
        serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected config response: {e}")))
    }

    pub fn set_config(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        self.client.call(
            "set_config",
            json!({ "project": self.name, "config_vars": vars }),
        )?;
        Ok(())
    }

    pub fn unset_config(&self, names: &[String]) -> Result<()> {
        self.client.call(
            "unset_config",
            json!({ "project": self.name, "names": names }),
        )?;
        Ok(())
    }

    pub fn list_volumes(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .call("volumes", json!({ "project": self.name }))?;
        let volumes: Vec<VolumeListing> = serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected volumes response: {e}")))?;
        Ok(volumes.into_iter().map(|v| v.volume).collect())
    }

    pub fn add_volume(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .call("add_volume", json!({ "project": self.name, "name": name }))?;
        let volume: VolumeListing = serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected volume response: {e}")))?;
        Ok(volume.volume)
    }

    pub fn remove_volume(&self, name: &str) -> Result<()> {
        self.client.call(
            "remove_volume",
            json!({ "project": self.name, "name": name }),
        )?;
        Ok(())
    }

    /// Lists the files at a volume path.
    pub fn ls(&self, path: &TransferPath) -> Result<Vec<VolumeEntry>> {
        let (volume, dir) = match path {
            TransferPath::Volume { volume, path } => (volume, path),
            TransferPath::Local(path) => {
                return Err(ClientError::Config(format!(
                    "{} is not a volume path",
                    path.display()
                )))
            }
        };
        let response = self.client.call(
            "ls_volume",
            json!({ "project": self.name, "volume": volume, "path": dir }),
        )?;
        serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected ls response: {e}")))
    }

    /// Packs the working directory into a tar archive and pushes it to
    /// the server, then waits for the server-side build to finish.
    pub fn deploy(&self) -> Result<Value> {
        let scratch = env::temp_dir().join(format!("skiff-deploy-{}", std::process::id()));
        fs::create_dir_all(&scratch)?;
        let result = self.deploy_from(&scratch);
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn deploy_from(&self, scratch: &Path) -> Result<Value> {
        let archive = self.archive(scratch)?;
        let size = fs::metadata(&archive)?.len();
        debug!(size, archive = %archive.display(), "uploading project archive");
        let file = fs::File::open(&archive)?;
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project.tar".into());
        let response = self.client.call_with_file(
            "deploy",
            &json!({ "project": self.name, "size": size, "format": "tar" }),
            "archived_project",
            file,
            &file_name,
        )?;
        RemoteTask::resolve(&self.client, response)
    }

    /// Archives the working directory into `rootdir` and returns the
    /// archive path.
    pub fn archive(&self, rootdir: &Path) -> Result<PathBuf> {
        let path = rootdir.join(format!("skiff-project-{}.tar", self.name));
        let file = fs::File::create(&path)?;
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", ".")?;
        builder.into_inner()?;
        Ok(path)
    }

    /// Copies between a volume and the local disk; the direction follows
    /// from which side names a volume.
    pub fn copy(&self, src: &TransferPath, dest: &TransferPath) -> Result<()> {
        match (src, dest) {
            (TransferPath::Volume { volume, path }, local @ TransferPath::Local(_)) => {
                let content = self.client.call_for_file(
                    "get_file",
                    json!({ "project": self.name, "volume": volume, "path": path }),
                )?;
                let name = src.file_name().unwrap_or_default();
                local.safe_write(content, &name)
            }
            (local @ TransferPath::Local(_), TransferPath::Volume { volume, path }) => {
                let file = local.open()?;
                let name = local.file_name().unwrap_or_default();
                let size = local.size()?;
                self.client.call_with_file(
                    "put_file",
                    &json!({
                        "project": self.name,
                        "volume": volume,
                        "path": path,
                        "name": name,
                        "size": size,
                    }),
                    "fileobj",
                    file,
                    &name,
                )?;
                Ok(())
            }
            _ => Err(ClientError::Config(
                "one of the paths has to be a volume, the other a local path".into(),
            )),
        }
    }

    pub fn get_model_repository(&self, name: &str) -> ModelRepository<'_> {
        ModelRepository::new(self, name)
    }

    /// Names of all model repositories in this project.
    pub fn list_model_repositories(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .call("list_models", json!({ "project": self.name }))?;
        serde_json::from_value(response)
            .map_err(|e| ClientError::Remote(format!("unexpected models response: {e}")))
    }

    /// The save history across model repositories, newest first, limited
    /// to one repository when `repo` is given.
    pub fn get_model_activity(&self, repo: Option<&str>) -> Result<Vec<ModelImage<'_>>> {
        let mut params = json!({ "project": self.name });
        if let Some(repo) = repo {
            params["name"] = repo.into();
        }
        let response = self.client.call("get_activity", params)?;
        let items = response
            .as_array()
            .ok_or_else(|| {
                ClientError::Remote(format!("unexpected activity response: {response}"))
            })?
            .clone();
        items
            .iter()
            .map(|item| ModelImage::from_metadata(self, item))
            .collect()
    }
}

// The log follower reads its data through the project handle.
impl JobSource for Project {
    fn fetch_logs(&self, jobid: &str) -> Result<Vec<LogLine>> {
        self.logs(jobid)
    }

    fn job_status(&self, jobid: &str) -> Result<JobStatus> {
        Ok(self.get_job(jobid)?.status)
    }
}

#[derive(Deserialize)]
struct ProjectListing {
    name: String,
    runtime: Option<String>,
}

#[derive(Deserialize)]
struct VolumeListing {
    volume: String,
}

fn job_from(response: Value) -> Result<Job> {
    serde_json::from_value(response)
        .map_err(|e| ClientError::Remote(format!("unexpected job response: {e}")))
}
