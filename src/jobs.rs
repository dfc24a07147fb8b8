// Jobs and their logs. A job is created remotely by a run request and only
// ever observed from here: the client polls `logs` and `ps` until the job
// reaches a terminal status. The poll loop is the one place in the whole
// client that blocks waiting for server-side state to change.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::api::Client;
use crate::error::{ClientError, Result};

/// Delay between consecutive polls of the server.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Cancelled,
    Failed,
}

impl JobStatus {
    /// Whether the job can make no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One remote job as reported by `ps`.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub jobid: String,
    pub status: JobStatus,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub details: JobDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobDetails {
    #[serde(default)]
    pub command: Vec<String>,
}

/// One log line of a job. Append-only and immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogLine {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub message: String,
}

/// Where the follower gets its data. The project handle implements this
/// against the live server; tests script it.
pub trait JobSource {
    fn fetch_logs(&self, jobid: &str) -> Result<Vec<LogLine>>;
    fn job_status(&self, jobid: &str) -> Result<JobStatus>;
}

impl<S: JobSource + ?Sized> JobSource for &S {
    fn fetch_logs(&self, jobid: &str) -> Result<Vec<LogLine>> {
        (**self).fetch_logs(jobid)
    }
    fn job_status(&self, jobid: &str) -> Result<JobStatus> {
        (**self).job_status(jobid)
    }
}

/// Lazy sequence of a job's log lines.
///
/// In snapshot mode this is one `logs` call. In follow mode each pull may
/// poll the server: fetch the full log list, emit the lines past the
/// already-seen count, then check the job status and stop once it is
/// terminal. Polling only happens while the consumer keeps pulling, so
/// dropping the iterator abandons the loop.
pub struct LogFollower<S> {
    source: S,
    jobid: String,
    follow: bool,
    interval: Duration,
    end_marker: Option<String>,
    seen: usize,
    buffer: VecDeque<LogLine>,
    done: bool,
    polled: bool,
}

impl<S: JobSource> LogFollower<S> {
    /// Every line currently stored server-side, then end of stream.
    pub fn snapshot(source: S, jobid: impl Into<String>) -> LogFollower<S> {
        LogFollower::new(source, jobid, false)
    }

    /// Follows the log until the job reaches a terminal status.
    pub fn follow(source: S, jobid: impl Into<String>) -> LogFollower<S> {
        LogFollower::new(source, jobid, true)
    }

    fn new(source: S, jobid: impl Into<String>, follow: bool) -> LogFollower<S> {
        LogFollower {
            source,
            jobid: jobid.into(),
            follow,
            interval: POLL_INTERVAL,
            end_marker: None,
            seen: 0,
            buffer: VecDeque::new(),
            done: false,
            polled: false,
        }
    }

    /// Ends the sequence just before the first line whose message starts
    /// with `marker`. Interactive-notebook jobs emit such a sentinel and
    /// it should not reach the user.
    pub fn end_marker(mut self, marker: impl Into<String>) -> LogFollower<S> {
        self.end_marker = Some(marker.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> LogFollower<S> {
        self.interval = interval;
        self
    }

    fn poll(&mut self) -> Result<()> {
        if self.polled {
            thread::sleep(self.interval);
        }
        self.polled = true;

        let lines = self.source.fetch_logs(&self.jobid)?;
        let total = lines.len();
        if total < self.seen {
            // The server handed back a shorter list than before. Emitting
            // from a rewound offset would duplicate lines, so skip this
            // batch and keep the offset where it was.
            debug!(total, seen = self.seen, "log list shrank, ignoring poll");
        } else {
            self.buffer.extend(lines.into_iter().skip(self.seen));
            self.seen = total;
        }

        if !self.follow {
            self.done = true;
            return Ok(());
        }
        let status = self.source.job_status(&self.jobid)?;
        if status.is_terminal() {
            debug!(%status, jobid = %self.jobid, "job finished");
            self.done = true;
        }
        Ok(())
    }
}

impl<S: JobSource> Iterator for LogFollower<S> {
    type Item = Result<LogLine>;

    fn next(&mut self) -> Option<Result<LogLine>> {
        loop {
            if let Some(line) = self.buffer.pop_front() {
                if let Some(marker) = &self.end_marker {
                    if line.message.starts_with(marker.as_str()) {
                        self.buffer.clear();
                        self.done = true;
                        return None;
                    }
                }
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.poll() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

/// Runs `poll` until it produces a value, sleeping `interval` between
/// attempts. Both the log follower and remote tasks wait this way: the
/// server owns the state, the client just asks again.
pub fn poll_until<T, F>(interval: Duration, mut poll: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    loop {
        if let Some(value) = poll()? {
            return Ok(value);
        }
        thread::sleep(interval);
    }
}

/// Handle on a long-running server-side task, as returned by `create` and
/// `deploy`. The flow is submitted → poll → result or error.
pub struct RemoteTask<'a> {
    client: &'a Client,
    taskid: String,
    interval: Duration,
}

impl<'a> RemoteTask<'a> {
    /// Resolves a `create`/`deploy` response: a direct result is returned
    /// as-is, a `{"taskid": ...}` envelope is polled to completion.
    pub fn resolve(client: &Client, response: Value) -> Result<Value> {
        match response.get("taskid").and_then(Value::as_str) {
            Some(taskid) => RemoteTask {
                client,
                taskid: taskid.to_string(),
                interval: POLL_INTERVAL,
            }
            .wait(),
            None => Ok(response),
        }
    }

    /// Blocks until the task finishes, returning its result value or the
    /// server-reported error.
    pub fn wait(&self) -> Result<Value> {
        debug!(taskid = %self.taskid, "waiting for task");
        poll_until(self.interval, || {
            let status = self
                .client
                .call("task_status", json!({ "taskid": self.taskid }))?;
            task_outcome(status)
        })
    }
}

// `None` means still pending; `Some` carries the result.
fn task_outcome(status: Value) -> Result<Option<Value>> {
    match status.get("status").and_then(Value::as_str) {
        Some("done") => Ok(Some(status.get("result").cloned().unwrap_or(Value::Null))),
        Some("error") => Err(ClientError::Remote(
            status
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("task failed")
                .to_string(),
        )),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn line(timestamp: i64, message: &str) -> LogLine {
        LogLine {
            timestamp,
            message: message.to_string(),
        }
    }

    /// Scripted server: each poll pops the next log list and status.
    struct Scripted {
        logs: RefCell<VecDeque<Vec<LogLine>>>,
        statuses: RefCell<VecDeque<JobStatus>>,
        fetches: Cell<usize>,
        status_checks: Cell<usize>,
    }

    impl Scripted {
        fn new(logs: Vec<Vec<LogLine>>, statuses: Vec<JobStatus>) -> Scripted {
            Scripted {
                logs: RefCell::new(logs.into()),
                statuses: RefCell::new(statuses.into()),
                fetches: Cell::new(0),
                status_checks: Cell::new(0),
            }
        }
    }

    impl JobSource for Scripted {
        fn fetch_logs(&self, _jobid: &str) -> Result<Vec<LogLine>> {
            self.fetches.set(self.fetches.get() + 1);
            let mut logs = self.logs.borrow_mut();
            let front = logs.pop_front().expect("script ran out of log lists");
            if logs.is_empty() {
                logs.push_back(front.clone());
            }
            Ok(front)
        }

        fn job_status(&self, _jobid: &str) -> Result<JobStatus> {
            self.status_checks.set(self.status_checks.get() + 1);
            let mut statuses = self.statuses.borrow_mut();
            let front = statuses.pop_front().expect("script ran out of statuses");
            if statuses.is_empty() {
                statuses.push_back(front);
            }
            Ok(front)
        }
    }

    fn messages(lines: Vec<Result<LogLine>>) -> Vec<String> {
        lines
            .into_iter()
            .map(|l| l.unwrap().message)
            .collect()
    }

    #[test]
    fn snapshot_yields_everything_in_one_fetch() {
        let source = Scripted::new(
            vec![vec![line(1, "a"), line(2, "b")]],
            vec![JobStatus::Running],
        );
        let lines: Vec<_> = LogFollower::snapshot(&source, "job-1").collect();
        assert_eq!(messages(lines), ["a", "b"]);
        assert_eq!(source.fetches.get(), 1);
        assert_eq!(source.status_checks.get(), 0);
    }

    #[test]
    fn follower_terminates_within_one_poll_of_terminal_status() {
        // Three polls report `running`, the fourth `success`.
        let source = Scripted::new(
            vec![
                vec![line(1, "a")],
                vec![line(1, "a"), line(2, "b")],
                vec![line(1, "a"), line(2, "b")],
                vec![line(1, "a"), line(2, "b"), line(3, "c")],
            ],
            vec![
                JobStatus::Running,
                JobStatus::Running,
                JobStatus::Running,
                JobStatus::Success,
            ],
        );
        let follower =
            LogFollower::follow(&source, "job-1").poll_interval(Duration::ZERO);
        let lines: Vec<_> = follower.collect();
        assert_eq!(messages(lines), ["a", "b", "c"]);
        assert_eq!(source.fetches.get(), 4);
    }

    #[test]
    fn every_line_is_emitted_exactly_once_in_order() {
        let source = Scripted::new(
            vec![
                vec![line(1, "one")],
                vec![line(1, "one"), line(2, "two"), line(3, "three")],
            ],
            vec![JobStatus::Running, JobStatus::Success],
        );
        let follower =
            LogFollower::follow(&source, "job-1").poll_interval(Duration::ZERO);
        assert_eq!(messages(follower.collect()), ["one", "two", "three"]);
    }

    #[test]
    fn end_marker_truncates_before_the_marker_line() {
        let source = Scripted::new(
            vec![vec![
                line(1, "a"),
                line(2, "b"),
                line(3, "----end----"),
                line(4, "c"),
            ]],
            vec![JobStatus::Success],
        );
        let follower = LogFollower::follow(&source, "job-1")
            .poll_interval(Duration::ZERO)
            .end_marker("----");
        assert_eq!(messages(follower.collect()), ["a", "b"]);
    }

    #[test]
    fn end_marker_applies_to_snapshots_too() {
        let source = Scripted::new(
            vec![vec![line(1, "a"), line(2, "== done =="), line(3, "b")]],
            vec![],
        );
        let follower = LogFollower::snapshot(&source, "job-1").end_marker("== done ==");
        assert_eq!(messages(follower.collect()), ["a"]);
    }

    #[test]
    fn shrinking_log_list_never_reemits() {
        let source = Scripted::new(
            vec![
                vec![line(1, "a"), line(2, "b"), line(3, "c")],
                // Shorter than what we already saw: must be skipped.
                vec![line(1, "a")],
                vec![line(1, "a"), line(2, "b"), line(3, "c"), line(4, "d")],
            ],
            vec![JobStatus::Running, JobStatus::Running, JobStatus::Success],
        );
        let follower =
            LogFollower::follow(&source, "job-1").poll_interval(Duration::ZERO);
        assert_eq!(messages(follower.collect()), ["a", "b", "c", "d"]);
    }

    #[test]
    fn source_error_surfaces_once_then_the_stream_ends() {
        struct Failing;
        impl JobSource for Failing {
            fn fetch_logs(&self, _jobid: &str) -> Result<Vec<LogLine>> {
                Err(ClientError::Remote("boom".into()))
            }
            fn job_status(&self, _jobid: &str) -> Result<JobStatus> {
                Ok(JobStatus::Running)
            }
        }
        let mut follower =
            LogFollower::follow(Failing, "job-1").poll_interval(Duration::ZERO);
        assert!(matches!(
            follower.next(),
            Some(Err(ClientError::Remote(_)))
        ));
        assert!(follower.next().is_none());
    }

    #[test]
    fn poll_until_returns_the_first_value() {
        let mut attempts = 0;
        let value = poll_until(Duration::ZERO, || {
            attempts += 1;
            Ok(if attempts == 3 { Some("ready") } else { None })
        })
        .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(attempts, 3);
    }

    #[test]
    fn poll_until_propagates_errors() {
        let err = poll_until(Duration::ZERO, || -> Result<Option<()>> {
            Err(ClientError::Remote("nope".into()))
        })
        .unwrap_err();
        assert!(matches!(err, ClientError::Remote(_)));
    }

    #[test]
    fn task_outcome_states() {
        assert_eq!(
            task_outcome(json!({"status": "done", "result": "ok"})).unwrap(),
            Some(json!("ok"))
        );
        assert_eq!(task_outcome(json!({"status": "pending"})).unwrap(), None);
        assert_eq!(task_outcome(json!({"status": "running"})).unwrap(), None);
        let err = task_outcome(json!({"status": "error", "message": "build failed"}))
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(m) if m == "build failed"));
    }

    #[test]
    fn status_parses_from_the_wire_spelling() {
        let status: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(status, JobStatus::Cancelled);
        assert!(status.is_terminal());
        assert!(!serde_json::from_str::<JobStatus>("\"pending\"")
            .unwrap()
            .is_terminal());
    }

    #[test]
    fn job_deserializes_from_a_ps_row() {
        let job: Job = serde_json::from_value(json!({
            "jobid": "J42",
            "status": "running",
            "start_time": "2018-03-01T10:00:00",
            "end_time": "2018-03-01T10:05:00",
            "instance_type": "S1",
            "details": {"command": ["python", "train.py"]}
        }))
        .unwrap();
        assert_eq!(job.jobid, "J42");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.details.command, ["python", "train.py"]);
    }
}
