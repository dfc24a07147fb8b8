// Library root
// -----------
// This crate exposes the SDK surface for the skiffdata platform. The
// binary (`main.rs`) uses these modules to implement the `skiff` CLI.
//
// Module responsibilities:
// - `auth`: The credential store, a netrc-format secrets file shared
//   with other tools on the machine.
// - `api`: One-shot authenticated RPC calls against the platform server,
//   with transport/authentication/application failures told apart.
// - `config`: Server URL and the per-project `skiff.yml` file.
// - `project`: The project handle and its operations (run, deploy,
//   config vars, volumes, file copies).
// - `jobs`: Job and log-line types, the log follower poll loop and the
//   pollable remote task used by create/deploy.
// - `models`: Model repositories, versioned model images and the codec
//   registry that serializes model objects.
// - `path`: The volume-or-local path argument of `cp`.
// - `ui`: Terminal prompts, spinners and table/log formatting.
// - `cli`: The clap command tree and per-command dispatch.
//
// Keeping this separation means the SDK can be used without the CLI,
// and the CLI stays a thin layer of argument handling and printing.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod path;
pub mod project;
pub mod ui;
