//! Construction of the supervised child process.
//!
//! Jobs are not spawned directly: the executor launches this same binary
//! again with a reserved `reexec` argv marker so that the final sandbox
//! setup (cgroup attach, hostname, private `/proc`) runs inside the fresh
//! namespace set. See [`crate::reexec`] for the in-child half.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::{getegid, geteuid, setpgid, Pid};
use tokio::process::Command;

use crate::job::Job;

/// Argv marker that routes the spawned process into [`crate::reexec::run`].
/// Must match the server binary's hidden subcommand.
pub(crate) const REEXEC_COMMAND: &str = "reexec";

/// Exit code used when a command cannot be resolved or spawned.
/// See: https://www.gnu.org/software/bash/manual/html_node/Exit-Status.html
pub(crate) const CANNOT_EXECUTE: i32 = 127;

const SELF_EXE_PATH: &str = "/proc/self/exe";

/// How the executor turns a [`Job`] into a child process.
#[derive(Clone, Debug)]
pub enum Launcher {
    /// Re-exec through [`SELF_EXE_PATH`] into fresh mount/PID/user/UTS
    /// namespaces with a per-job cgroup under `cgroup_root`.
    Sandboxed {
        cgroup_root: PathBuf,
        isolate_network: bool,
    },
    /// Run the command directly, with no namespaces or cgroup. Used by the
    /// test suite and for unprivileged local runs.
    Direct,
}

impl Launcher {
    pub(crate) fn command(&self, job: &Job) -> Command {
        match self {
            Launcher::Sandboxed {
                cgroup_root,
                isolate_network,
            } => sandbox_command(&cgroup_root.join(job.id.to_string()), job, *isolate_network),
            Launcher::Direct => {
                let mut cmd = Command::new(&job.command);
                cmd.args(&job.args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                cmd
            }
        }
    }
}

/// Builds the re-exec wrapper command for `job`.
///
/// The `pre_exec` hook runs in the forked child, single-threaded, before
/// exec: it detaches the process group (so stopping a job can never signal
/// the server), unshares the namespace set, self-maps uid/gid 0 onto the
/// invoking user, and arms `PR_SET_PDEATHSIG` so the wrapper dies with us.
fn sandbox_command(cgroup_path: &Path, job: &Job, isolate_network: bool) -> Command {
    let mut cmd = Command::new(SELF_EXE_PATH);
    cmd.arg(REEXEC_COMMAND)
        .arg("--cgroup-root")
        .arg(cgroup_path)
        .arg("--")
        .arg(&job.command)
        .args(&job.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWUTS;
    if isolate_network {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    // Formatted before the fork; the child only writes them out.
    let uid_map = format!("0 {} 1", geteuid());
    let gid_map = format!("0 {} 1", getegid());

    unsafe {
        cmd.pre_exec(move || {
            setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)?;
            unshare(flags).map_err(io::Error::from)?;
            write_id_maps(&uid_map, &gid_map)?;
            prctl::set_pdeathsig(Signal::SIGTERM).map_err(io::Error::from)?;
            Ok(())
        });
    }

    cmd
}

/// Maps uid/gid 0 inside the new user namespace onto the invoking host
/// user. `setgroups` must be denied before `gid_map` becomes writable.
fn write_id_maps(uid_map: &str, gid_map: &str) -> io::Result<()> {
    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/gid_map", gid_map)?;
    std::fs::write("/proc/self/uid_map", uid_map)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_command_argv() {
        let job = Job::new("alice", "echo", vec!["-n".into(), "hi".into()]);
        let cmd = sandbox_command(Path::new("/sys/fs/cgroup/test"), &job, false);

        let argv: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "reexec",
                "--cgroup-root",
                "/sys/fs/cgroup/test",
                "--",
                "echo",
                "-n",
                "hi"
            ]
        );
        assert_eq!(cmd.as_std().get_program().to_string_lossy(), SELF_EXE_PATH);
    }
}
