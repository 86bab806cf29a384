//! In-child sandbox supervisor.
//!
//! [`run`] executes inside the namespaces set up at spawn time (see
//! [`crate::spawn`]) and performs the setup that can only happen there:
//! the per-job cgroup, the `sandbox` hostname, and a private `/proc`. It
//! then execs the requested command as its own child, forwards termination
//! signals to it, and tears the sandbox back down once it exits.
//!
//! This must only ever be invoked through the binary's hidden `reexec`
//! subcommand, on the main thread and before any runtime threads exist:
//! `PR_SET_PDEATHSIG` is a per-thread attribute, so the supervising thread
//! has to stay alive (and be *this* thread) until the child is reaped.

use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::mount::{mount, umount, MsFlags};
use nix::sys::prctl;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::sethostname;

use crate::cgroup;
use crate::spawn::CANNOT_EXECUTE;

const SANDBOX_HOSTNAME: &str = "sandbox";

/// Pid of the wrapped command, for the signal forwarder. Zero while no
/// child is running.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Runs `command` (program followed by its arguments) inside the sandbox
/// rooted at `cgroup_root` and returns the exit code the wrapper process
/// should exit with.
///
/// The child's exit code is propagated unchanged; a child killed by a
/// signal is reported as `128 + signal`, and a command that cannot be
/// resolved or spawned as `127`.
pub fn run(cgroup_root: &Path, command: &[String]) -> i32 {
    if command.is_empty() {
        eprintln!("reexec: no command given");
        return CANNOT_EXECUTE;
    }

    if let Err(err) = setup(cgroup_root) {
        eprintln!("reexec: sandbox setup failed: {err}");
        teardown(cgroup_root);
        return CANNOT_EXECUTE;
    }

    let code = match supervise(cgroup_root, &command[0], &command[1..]) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("reexec: {}: {err}", command[0]);
            CANNOT_EXECUTE
        }
    };

    teardown(cgroup_root);
    code
}

/// Sandbox setup that has to happen before the child is spawned. Any
/// failure aborts the job; the caller still runs [`teardown`].
fn setup(cgroup_root: &Path) -> io::Result<()> {
    cgroup::create(cgroup_root)?;

    sethostname(SANDBOX_HOSTNAME).map_err(io::Error::from)?;

    // The rootfs stays shared with the host, so /proc has to be made a
    // recursive private mount before a fresh procfs can go over it without
    // touching the host's view.
    mount(
        Some("/proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(io::Error::from)?;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(io::Error::from)?;

    Ok(())
}

/// Undoes [`setup`] after the child terminated. Errors are ignored: this
/// also runs on signal paths, and logging here would end up interleaved
/// with the wrapped command's output.
fn teardown(cgroup_root: &Path) {
    let _ = umount("/proc");
    cgroup::cleanup(cgroup_root);
}

fn supervise(cgroup_root: &Path, program: &str, args: &[String]) -> io::Result<i32> {
    let path = resolve_program(program)?;

    // Opened before the fork so the child only has to write its pid; the
    // exec'd command is inside the cgroup before its first instruction.
    let procs = fs::OpenOptions::new()
        .write(true)
        .open(cgroup_root.join("cgroup.procs"))?;

    install_forwarder()?;

    let mut cmd = Command::new(&path);
    cmd.args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    unsafe {
        cmd.pre_exec(move || {
            let pid = format!("{}\n", libc::getpid());
            let n = libc::write(
                procs.as_raw_fd(),
                pid.as_ptr() as *const libc::c_void,
                pid.len(),
            );
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            prctl::set_pdeathsig(Signal::SIGTERM).map_err(io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    CHILD_PID.store(child.id() as i32, Ordering::SeqCst);
    let status = child.wait();
    CHILD_PID.store(0, Ordering::SeqCst);

    Ok(exit_code(status?))
}

/// Relays SIGTERM/SIGINT to the wrapped command instead of dying with it
/// unreaped; the wrapper then exits through the normal wait/teardown path.
fn install_forwarder() -> io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).map_err(io::Error::from)?;
        sigaction(Signal::SIGINT, &action).map_err(io::Error::from)?;
    }
    Ok(())
}

extern "C" fn forward_signal(_sig: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        // neither exited nor signaled should be unreachable; use an
        // out-of-range sentinel rather than guessing
        255
    }
}

/// Resolves `program` the way exec would: paths are taken as given, bare
/// names are searched for an executable regular file on `PATH`.
fn resolve_program(program: &str) -> io::Result<PathBuf> {
    let candidate = Path::new(program);
    if candidate.is_absolute() || program.contains('/') {
        return Ok(candidate.to_path_buf());
    }

    for dir in env::split_paths(&env::var_os("PATH").unwrap_or_default()) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "command not found",
    ))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_absolute_and_relative_paths_verbatim() {
        assert_eq!(
            resolve_program("/bin/echo").unwrap(),
            PathBuf::from("/bin/echo")
        );
        assert_eq!(
            resolve_program("./scripts/run.sh").unwrap(),
            PathBuf::from("./scripts/run.sh")
        );
    }

    #[test]
    fn searches_path_for_bare_names() {
        let resolved = resolve_program("sh").expect("sh must be on PATH");
        assert!(resolved.is_absolute());
        assert!(is_executable(&resolved));
    }

    #[test]
    fn unknown_command_is_not_found() {
        let err = resolve_program("definitely-not-a-command-4a1b").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn exit_codes_for_signals_use_shell_convention() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        // raw wait status: low byte is the terminating signal
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGTERM)), 143);
    }
}
