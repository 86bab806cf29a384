//! Per-job cgroup v2 setup.
//!
//! Each job gets its own cgroup directory with a fixed set of CPU, memory,
//! and block IO constraints. Only the unified (v2) hierarchy is supported;
//! the `cpu`, `memory`, and `io` controllers must already be enabled in the
//! parent's `cgroup.subtree_control`.

use std::fs;
use std::io;
use std::path::Path;

use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};

const REQUIRED_CONTROLLERS: [&str; 3] = ["cpu", "memory", "io"];

// 10% of one CPU, 512M of memory with a 384M soft ceiling, no swap.
const CONSTRAINTS: [(&str, &str); 4] = [
    ("cpu.max", "100000 1000000"),
    ("memory.max", "512M"),
    ("memory.high", "384M"),
    ("memory.swap.max", "0"),
];

const IO_RBPS_LIMIT: u64 = 83_886_080;
const IO_WBPS_LIMIT: u64 = 41_943_040;
const IO_RIOPS_LIMIT: u64 = 1_000;
const IO_WIOPS_LIMIT: u64 = 1_000;

const SYS_BLOCK: &str = "/sys/block";

/// Creates a new cgroup at `path` and applies the fixed CPU, memory, and IO
/// constraints. On any error the directory is removed again so a failed
/// start never leaves a half-configured cgroup behind.
pub fn create(path: &Path) -> io::Result<()> {
    if let Err(err) = try_create(path) {
        let _ = fs::remove_dir(path);
        return Err(err);
    }
    Ok(())
}

/// Removes the cgroup created at `path`. Errors are ignored; this runs on
/// signal and teardown paths where there is nothing left to do about them.
pub fn cleanup(path: &Path) {
    let _ = fs::remove_dir(path);
}

fn try_create(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    validate_cgroup2(path)?;
    check_controllers(path)?;
    apply_constraints(path)
}

/// Ensures the filesystem backing `path` is the cgroup v2 hierarchy.
fn validate_cgroup2(path: &Path) -> io::Result<()> {
    let st = statfs(path).map_err(io::Error::from)?;
    if st.filesystem_type() != CGROUP2_SUPER_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unsupported cgroup configuration, only cgroup v2 is supported",
        ));
    }
    Ok(())
}

fn check_controllers(path: &Path) -> io::Result<()> {
    let raw = fs::read_to_string(path.join("cgroup.controllers"))?;
    let missing = missing_controllers(&raw);
    // The parent's subtree_control is the administrator's responsibility;
    // nothing is enabled on their behalf here.
    if !missing.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("missing required controllers {missing:?} in {:?}", raw.trim()),
        ));
    }
    Ok(())
}

fn missing_controllers(raw: &str) -> Vec<&'static str> {
    let available: Vec<&str> = raw.split_whitespace().collect();
    REQUIRED_CONTROLLERS
        .iter()
        .copied()
        .filter(|c| !available.contains(c))
        .collect()
}

fn apply_constraints(path: &Path) -> io::Result<()> {
    for (file, value) in CONSTRAINTS {
        fs::write(path.join(file), value).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to apply constraint to file {file}: {err}"),
            )
        })?;
    }

    // One io.max line per block device; each write sets that device's limit.
    for device in block_devices()? {
        fs::write(path.join("io.max"), io_constraint(&device)).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to apply io constraint for device {device}: {err}"),
            )
        })?;
    }

    Ok(())
}

/// Formats the `io.max` rule for a `major:minor` block device.
fn io_constraint(major_minor: &str) -> String {
    format!(
        "{major_minor} rbps={IO_RBPS_LIMIT} wbps={IO_WBPS_LIMIT} riops={IO_RIOPS_LIMIT} wiops={IO_WIOPS_LIMIT}"
    )
}

/// Reads the `major:minor` of every block device under `/sys/block`.
/// A host without `/sys/block` simply has no IO constraints applied.
fn block_devices() -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(SYS_BLOCK) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut devices = Vec::new();
    for entry in entries {
        let dev_file = entry?.path().join("dev");
        let raw = fs::read_to_string(dev_file)?;
        devices.push(raw.trim().to_string());
    }
    Ok(devices)
}
