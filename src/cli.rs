// Command-line front end: argument parsing with clap and one dispatch
// function per subcommand. All real work happens in the project handle;
// this module only collects arguments and formats output.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::api::Client;
use crate::auth::CredentialStore;
use crate::config;
use crate::error::ClientError;
use crate::jobs::LogFollower;
use crate::models::parse_model_ref;
use crate::path::TransferPath;
use crate::project::Project;
use crate::ui;

#[derive(Parser)]
#[command(
    name = "skiff",
    version,
    about = "Command-line client for the skiffdata platform"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Login to the skiffdata platform.
    Login {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Shows who is currently logged in.
    Whoami,
    /// Lists all the projects.
    Projects,
    /// Creates a new project.
    Create { project: String },
    /// Pushes the local changes to the cloud and restarts all the services.
    Deploy,
    /// Copy files between volumes and the local disk.
    ///
    /// `skiff cp data:/dataset.txt ./dataset.txt` downloads the file,
    /// `skiff cp ./dataset.txt data:/dataset.txt` uploads it.
    Cp { src: String, dest: String },
    /// Shows the processes running in this project.
    Ps {
        #[arg(short, long)]
        all: bool,
    },
    /// Restarts the service specified by name.
    #[command(name = "ps:restart")]
    PsRestart { name: String },
    /// Lists all config vars of this project.
    Config,
    /// Sets one or more config vars, given as KEY=VALUE pairs.
    #[command(name = "config:set")]
    ConfigSet {
        #[arg(required = true)]
        vars: Vec<String>,
    },
    /// Unsets one or more config vars.
    #[command(name = "config:unset")]
    ConfigUnset {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Runs the given command in the cloud.
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Runs a notebook and follows its output.
    #[command(name = "run:notebook")]
    RunNotebook,
    /// Stops the job with the given jobid.
    Stop { jobid: String },
    /// Starts the service specified by name.
    Start { service: String },
    /// Restarts the service specified by name.
    Restart { service: String },
    /// Shows the logs of a job.
    Logs {
        jobid: String,
        #[arg(short = 's', long)]
        show_timestamp: bool,
        #[arg(short, long)]
        follow: bool,
    },
    /// Lists all the volumes of this project.
    Volumes,
    /// Adds a new volume to this project.
    #[command(name = "volumes:add")]
    VolumesAdd { name: String },
    /// Removes a volume from this project.
    #[command(name = "volumes:remove")]
    VolumesRemove { name: String },
    /// Lists the files in a volume, `volume` or `volume:dir`.
    #[command(name = "volumes:ls")]
    VolumesLs { path: String },
    /// Lists the model repositories of this project.
    Models,
    /// Shows the model save history.
    #[command(name = "models:log")]
    ModelsLog {
        name: Option<String>,
        /// Show all fields.
        #[arg(short, long)]
        all: bool,
    },
    /// Shows one model image, `name`, `name:version` or `name:tag`.
    #[command(name = "models:show")]
    ModelsShow { modelref: String },
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Login { email, password } => login(email, password),
        Command::Whoami => whoami(),
        Command::Projects => projects(),
        Command::Create { project } => create(&project),
        Command::Deploy => deploy(),
        Command::Cp { src, dest } => cp(&src, &dest),
        Command::Ps { all } => ps(all),
        Command::PsRestart { name } => restart(&name),
        Command::Config => show_config(),
        Command::ConfigSet { vars } => config_set(&vars),
        Command::ConfigUnset { names } => config_unset(&names),
        Command::Run { command } => run_command(&command),
        Command::RunNotebook => run_notebook(),
        Command::Stop { jobid } => stop(&jobid),
        Command::Start { service } => start(&service),
        Command::Restart { service } => restart(&service),
        Command::Logs {
            jobid,
            show_timestamp,
            follow,
        } => logs(&jobid, show_timestamp, follow),
        Command::Volumes => volumes(),
        Command::VolumesAdd { name } => volumes_add(&name),
        Command::VolumesRemove { name } => volumes_remove(&name),
        Command::VolumesLs { path } => volumes_ls(&path),
        Command::Models => models(),
        Command::ModelsLog { name, all } => models_log(name.as_deref(), all),
        Command::ModelsShow { modelref } => models_show(&modelref),
    }
}

fn login(email: Option<String>, password: Option<String>) -> Result<()> {
    let (email, password) = ui::prompt_login(email, password)?;
    let client = Client::from_env()?;
    let bar = ui::spinner("Logging in...");
    let token = client.login(&email, &password);
    bar.finish_and_clear();
    let token = token?;

    let host = config::host_name(client.server_url())?;
    let store = CredentialStore::open_default()?;
    store.save(&host, &email, &token)?;
    println!("Logged in as {email}");
    Ok(())
}

fn whoami() -> Result<()> {
    let client = Client::from_env()?;
    println!("{}", client.whoami()?);
    Ok(())
}

fn projects() -> Result<()> {
    for project in Project::find_all()? {
        println!("{}", project.name);
    }
    Ok(())
}

fn create(name: &str) -> Result<()> {
    let project = Project::new(name, None)?;
    project.create()?;
    println!("Created project: {name}");
    Ok(())
}

fn deploy() -> Result<()> {
    let project = Project::current()?;
    println!(
        "Deploying project {}. This may take a few moments ...",
        project.name
    );
    let bar = ui::spinner("Deploying...");
    let response = project.deploy();
    bar.finish_and_clear();
    print_value(&response?);
    Ok(())
}

fn cp(src: &str, dest: &str) -> Result<()> {
    let src = TransferPath::parse(src);
    let dest = TransferPath::parse(dest);
    if src.is_volume() == dest.is_volume() {
        bail!("One of the arguments has to be a volume, the other a local path");
    }
    let project = Project::current()?;
    project.copy(&src, &dest)?;
    Ok(())
}

fn ps(all: bool) -> Result<()> {
    let project = Project::current()?;
    let jobs = project.ps(all)?;
    let now = Utc::now();
    let rows: Vec<Vec<String>> = jobs
        .into_iter()
        .map(|job| {
            let start = job.start_time.as_deref().and_then(ui::parse_time);
            let end = job.end_time.as_deref().and_then(ui::parse_time);
            let when = start
                .map(|s| ui::datestr(s, now))
                .unwrap_or_else(|| "-".into());
            let time = match (start, end) {
                (Some(start), Some(end)) => ui::elapsed(start, end),
                _ => "-".into(),
            };
            vec![
                job.jobid,
                job.status.to_string(),
                when,
                time,
                job.instance_type.unwrap_or_default(),
                ui::truncate(&job.details.command.join(" "), 50),
            ]
        })
        .collect();
    print!(
        "{}",
        ui::format_table(
            Some(&["JOBID", "STATUS", "WHEN", "TIME", "INSTANCE TYPE", "CMD"]),
            &rows
        )
    );
    Ok(())
}

fn show_config() -> Result<()> {
    let project = Project::current()?;
    let vars = project.get_config()?;
    println!("=== {} Config Vars", project.name);
    for (key, value) in vars {
        println!("{key}: {value}");
    }
    Ok(())
}

fn config_set(vars: &[String]) -> Result<()> {
    let project = Project::current()?;
    let mut parsed = BTreeMap::new();
    for var in vars {
        match var.split_once('=') {
            Some((key, value)) => parsed.insert(key.to_string(), value.to_string()),
            None => parsed.insert(var.clone(), String::new()),
        };
    }
    project.set_config(&parsed)?;
    println!("Updated config vars");
    Ok(())
}

fn config_unset(names: &[String]) -> Result<()> {
    let project = Project::current()?;
    project.unset_config(names)?;
    println!("Updated config vars");
    Ok(())
}

fn run_command(command: &[String]) -> Result<()> {
    let project = Project::current()?;
    let job = project.run(command, None)?;
    println!("Started new job {}", job.jobid);
    Ok(())
}

fn run_notebook() -> Result<()> {
    let project = Project::current()?;
    let job = project.run_notebook(None)?;
    // The notebook runner prints a sentinel line once the session is up;
    // everything after it is internal chatter.
    follow_logs(&project, &job.jobid, true, false, Some("-".repeat(40)))
}

fn stop(jobid: &str) -> Result<()> {
    let project = Project::current()?;
    project.stop(jobid)?;
    Ok(())
}

fn start(service: &str) -> Result<()> {
    let project = Project::current()?;
    project.start(service)?;
    println!("Started service {service}");
    Ok(())
}

fn restart(service: &str) -> Result<()> {
    let project = Project::current()?;
    project.restart(service)?;
    println!("Restarted service {service}");
    Ok(())
}

fn logs(jobid: &str, show_timestamp: bool, follow: bool) -> Result<()> {
    let project = Project::current()?;
    follow_logs(&project, jobid, follow, show_timestamp, None)
}

fn follow_logs(
    project: &Project,
    jobid: &str,
    follow: bool,
    show_timestamp: bool,
    end_marker: Option<String>,
) -> Result<()> {
    let mut follower = if follow {
        LogFollower::follow(project, jobid)
    } else {
        LogFollower::snapshot(project, jobid)
    };
    if let Some(marker) = end_marker {
        follower = follower.end_marker(marker);
    }
    for line in follower {
        let line = line?;
        println!("{}", ui::render_log_line(&line, show_timestamp));
    }
    Ok(())
}

fn volumes() -> Result<()> {
    let project = Project::current()?;
    let volumes = project.list_volumes()?;
    if volumes.is_empty() {
        println!("No volumes are attached to {}", project.name);
    }
    for volume in volumes {
        println!("{volume}");
    }
    Ok(())
}

fn volumes_add(name: &str) -> Result<()> {
    let project = Project::current()?;
    let volume = project.add_volume(name)?;
    println!("Volume {volume} added to the project {}", project.name);
    Ok(())
}

fn volumes_remove(name: &str) -> Result<()> {
    let project = Project::current()?;
    project.remove_volume(name)?;
    println!("Volume {name} removed from the project {}", project.name);
    Ok(())
}

fn volumes_ls(path: &str) -> Result<()> {
    // A bare volume name lists its root.
    let qualified = if path.contains(':') {
        path.to_string()
    } else {
        format!("{path}:")
    };
    let path = TransferPath::parse(&qualified);
    let project = Project::current()?;
    let entries = project.ls(&path)?;
    let rows: Vec<Vec<String>> = entries
        .into_iter()
        .map(|e| vec![e.mode, e.size.to_string(), e.name])
        .collect();
    print!("{}", ui::format_table(None, &rows));
    Ok(())
}

fn models() -> Result<()> {
    let project = Project::current()?;
    for name in project.list_model_repositories()? {
        println!("{name}");
    }
    Ok(())
}

fn models_log(name: Option<&str>, all: bool) -> Result<()> {
    let project = Project::current()?;
    for image in project.get_model_activity(name)? {
        if all {
            println!("{image}");
        } else {
            println!("{}", image.summary());
        }
    }
    Ok(())
}

fn models_show(modelref: &str) -> Result<()> {
    let project = Project::current()?;
    let (name, version, tag) = parse_model_ref(modelref);
    let repo = project.get_model_repository(&name);
    match repo.get_image(version, tag.as_deref())? {
        Some(image) => print!("{image}"),
        None => bail!("Invalid model reference {modelref:?}"),
    }
    Ok(())
}

fn print_value(value: &serde_json::Value) {
    match value {
        serde_json::Value::String(text) => println!("{text}"),
        other => println!("{other}"),
    }
}

/// Exit code for a failed invocation: typed client errors carry their
/// own mapping, anything else is a plain failure.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<ClientError>()
        .map(ClientError::exit_code)
        .unwrap_or(3)
}
