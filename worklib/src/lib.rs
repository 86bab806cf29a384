pub mod buffer;
pub mod cgroup;
pub mod error;
pub mod executor;
pub mod job;
pub mod reexec;
mod spawn;

pub use buffer::{NotifyingBuffer, OutputReader};
pub use error::{Error, Result};
pub use executor::Executor;
pub use job::{Job, JobState};
pub use spawn::Launcher;

#[cfg(test)]
mod worklib_tests {
    use super::*;

    /// Runs commands directly, without the re-exec sandbox: the test binary
    /// cannot serve as the re-exec supervisor and the suite must not require
    /// privileges. The lifecycle, buffering, and streaming paths are
    /// identical in both launch modes.
    fn executor() -> Executor {
        Executor::with_launcher(Launcher::Direct)
    }

    async fn collect_output(mut reader: OutputReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = reader.read(&mut chunk).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn happy_path() {
        let exe = executor();
        let job = exe
            .start(Job::new("alice", "echo", vec!["hello".into()]))
            .expect("job start err");
        assert_eq!(job.owner, "alice");
        assert!(job.name().starts_with("users/alice/jobs/"));

        let output = collect_output(exe.open_reader(job.id).unwrap()).await;
        assert_eq!(String::from_utf8_lossy(&output), "hello\n");

        let done = exe.wait(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.exit_code, 0);
        assert!(done.start.unwrap() <= done.end.unwrap());
    }

    #[tokio::test]
    async fn stop_while_running() {
        let exe = executor();
        let job = exe
            .start(Job::new("alice", "sleep", vec!["60".into()]))
            .expect("job start err");

        assert_eq!(exe.running(job.id), Some(true));
        exe.stop(job.id).unwrap();

        let done = exe.wait(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Stopped);
        // sleep dies to SIGTERM: 128 + 15
        assert_eq!(done.exit_code, 143);
        assert_eq!(exe.running(job.id), Some(false));
    }

    #[tokio::test]
    async fn failing_command() {
        let exe = executor();
        let job = exe.start(Job::new("alice", "false", vec![])).unwrap();

        let done = exe.wait(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.exit_code, 1);

        let output = collect_output(exe.open_reader(job.id).unwrap()).await;
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn multi_watcher_fanout() {
        let exe = executor();
        let job = exe
            .start(Job::new(
                "alice",
                "sh",
                vec!["-c".into(), "yes x | head -n 20000".into()],
            ))
            .unwrap();

        // half the watchers tail the live job...
        let mut watchers = Vec::new();
        for _ in 0..10 {
            watchers.push(tokio::spawn(collect_output(
                exe.open_reader(job.id).unwrap(),
            )));
        }

        exe.wait(job.id).await.unwrap();

        // ...and the other half replay after termination
        for _ in 0..10 {
            watchers.push(tokio::spawn(collect_output(
                exe.open_reader(job.id).unwrap(),
            )));
        }

        let expected: Vec<u8> = b"x\n".repeat(20_000);
        for watcher in watchers {
            assert_eq!(watcher.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn replay_after_termination() {
        let exe = executor();
        let job = exe
            .start(Job::new("alice", "echo", vec!["history".into()]))
            .unwrap();
        exe.wait(job.id).await.unwrap();

        // opened well after the job completed
        let output = collect_output(exe.open_reader(job.id).unwrap()).await;
        assert_eq!(String::from_utf8_lossy(&output), "history\n");
    }

    #[tokio::test]
    async fn end_of_stream_implies_terminal_state() {
        let exe = executor();
        let job = exe
            .start(Job::new("alice", "echo", vec!["done".into()]))
            .unwrap();

        // drive the reader to end-of-stream without going through wait()
        collect_output(exe.open_reader(job.id).unwrap()).await;

        // buffer close happens-before the terminal state is observable
        let seen = exe.lookup(job.id).unwrap();
        assert!(seen.state.is_terminal());
        assert!(seen.end.is_some());
    }

    #[tokio::test]
    async fn stderr_is_interleaved_into_the_stream() {
        let exe = executor();
        let job = exe
            .start(Job::new(
                "alice",
                "sh",
                vec!["-c".into(), "echo out; echo err 1>&2".into()],
            ))
            .unwrap();
        exe.wait(job.id).await.unwrap();

        let mut lines = collect_output(exe.open_reader(job.id).unwrap()).await;
        lines.sort_unstable();
        let mut expected = b"out\nerr\n".to_vec();
        expected.sort_unstable();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn shutdown_stops_running_jobs() {
        let exe = executor();
        let long = exe
            .start(Job::new("alice", "sleep", vec!["60".into()]))
            .unwrap();
        let short = exe.start(Job::new("bob", "true", vec![])).unwrap();
        exe.wait(short.id).await.unwrap();

        exe.shutdown();

        let done = exe.wait(long.id).await.unwrap();
        assert_eq!(done.state, JobState::Stopped);
        // the already-terminal job is untouched
        assert_eq!(exe.lookup(short.id).unwrap().state, JobState::Completed);
    }
}
