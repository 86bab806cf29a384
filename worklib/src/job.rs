use std::fmt;
use std::time::SystemTime;

use uuid::Uuid;

/// Where a [`Job`] is in its lifecycle.
///
/// `Running` is the only non-terminal state. Terminal states are absorbing:
/// once a job leaves `Running` none of its fields change again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// The job is currently running.
    Running,
    /// The job ran to completion and exited zero.
    Completed,
    /// The job exited non-zero.
    Failed,
    /// The job was stopped by a user before completing.
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A single supervised invocation of an external command.
///
/// The executor owns the authoritative copy; everything handed out by
/// [`crate::Executor::lookup`] and friends is a snapshot.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    /// Principal that created this job.
    pub owner: String,
    /// Executable path or name to run.
    pub command: String,
    pub args: Vec<String>,
    /// When the subprocess began execution.
    pub start: Option<SystemTime>,
    /// When the job terminated. Only set once `state` is terminal.
    pub end: Option<SystemTime>,
    pub state: JobState,
    /// Exit code of the subprocess. Only meaningful once `state` is terminal.
    pub exit_code: i32,
}

impl Job {
    pub fn new(owner: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            command: command.into(),
            args,
            start: None,
            end: None,
            state: JobState::Running,
            exit_code: 0,
        }
    }

    /// The job's resource name: `users/<owner>/jobs/<id>`.
    pub fn name(&self) -> String {
        format!("users/{}/jobs/{}", self.owner, self.id)
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    /// Parses a resource name back into its owner and job id.
    /// Returns `None` for anything that is not `users/<owner>/jobs/<uuid>`.
    pub fn parse_name(name: &str) -> Option<(&str, Uuid)> {
        let rest = name.strip_prefix("users/")?;
        let (owner, rest) = rest.split_once('/')?;
        if owner.is_empty() {
            return None;
        }
        let id = rest.strip_prefix("jobs/")?;
        let id = Uuid::parse_str(id).ok()?;
        Some((owner, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips() {
        let job = Job::new("alice", "echo", vec!["hi".into()]);
        let name = job.name();
        let (owner, id) = Job::parse_name(&name).expect("derived name must parse");
        assert_eq!(owner, "alice");
        assert_eq!(id, job.id);
    }

    #[test]
    fn parse_rejects_malformed_names() {
        let id = Uuid::new_v4();
        for name in [
            "",
            "users/alice",
            "users/alice/jobs/",
            "users/alice/jobs/not-a-uuid",
            "users//jobs/00000000-0000-0000-0000-000000000000",
            &format!("groups/alice/jobs/{id}"),
            &format!("users/alice/tasks/{id}"),
        ] {
            assert!(Job::parse_name(name).is_none(), "accepted {name:?}");
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Stopped.is_terminal());
    }
}
