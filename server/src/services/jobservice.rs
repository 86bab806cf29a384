use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::Stream;
use protobuf::jobs_server::Jobs;
use protobuf::{
    GetJobStatusRequest, JobOutput, JobStatus, StartJobRequest, StartJobResponse, StopJobRequest,
    StopJobResponse, WatchJobOutputRequest,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{error, info};
use worklib::{Executor, Job};

use crate::interceptors::cert::CallerIdentity;

/// The privileged principal; may access any job.
const ADMIN_PRINCIPAL: &str = "admin";

/// Scratch buffer size for one streamed output chunk.
const WATCH_CHUNK_SIZE: usize = 10 * 1024;

/// Bound on chunks queued ahead of the transport; a slow watcher only slows
/// its own reads.
const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Implements the `jobforge.v1.Jobs` service on top of a [`worklib::Executor`].
pub struct JobsService {
    executor: Executor,
}

impl JobsService {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    fn caller<T>(req: &Request<T>) -> Result<String, Status> {
        req.extensions()
            .get::<CallerIdentity>()
            .map(|identity| identity.principal.clone())
            .ok_or_else(|| Status::unauthenticated("missing caller identity"))
    }

    /// Resolves a job resource name and checks that `principal` may access
    /// it: `admin` may access any job, everyone else only their own. A name
    /// whose owner segment does not match the stored job is treated as
    /// nonexistent rather than leaking whose job the id belongs to.
    fn resolve_job(&self, principal: &str, name: &str) -> Result<Job, Status> {
        let (owner, id) = Job::parse_name(name)
            .ok_or_else(|| Status::invalid_argument(format!("invalid job name '{name}'")))?;

        let job = self
            .executor
            .lookup(id)
            .map_err(|_| Status::not_found(format!("no job found for name '{name}'")))?;
        if job.owner != owner {
            return Err(Status::not_found(format!("no job found for name '{name}'")));
        }

        if principal != ADMIN_PRINCIPAL && job.owner != principal {
            info!(principal, name, "denied access");
            return Err(Status::permission_denied(format!(
                "resource '{name}' is not accessible by user '{principal}'"
            )));
        }

        Ok(job)
    }
}

#[tonic::async_trait]
impl Jobs for JobsService {
    type WatchJobOutputStream = Pin<Box<dyn Stream<Item = Result<JobOutput, Status>> + Send>>;

    async fn start_job(
        &self,
        req: Request<StartJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        let principal = Self::caller(&req)?;
        let StartJobRequest { command, args } = req.into_inner();
        if command.is_empty() {
            return Err(Status::invalid_argument("command must not be empty"));
        }

        let job = self
            .executor
            .start(Job::new(principal, command, args))
            .map_err(|err| {
                error!(%err, "failed to start job");
                to_status(err)
            })?;

        Ok(Response::new(StartJobResponse {
            name: job.name(),
            state: state_to_pb(job.state) as i32,
        }))
    }

    async fn get_job_status(
        &self,
        req: Request<GetJobStatusRequest>,
    ) -> Result<Response<JobStatus>, Status> {
        let principal = Self::caller(&req)?;
        let job = self.resolve_job(&principal, &req.get_ref().name)?;

        // end and exit code are only reported once they mean something
        let terminal = job.state.is_terminal();
        Ok(Response::new(JobStatus {
            name: job.name(),
            state: state_to_pb(job.state) as i32,
            start_ms: job.start.map(unix_ms).unwrap_or_default(),
            end_ms: if terminal {
                job.end.map(unix_ms).unwrap_or_default()
            } else {
                0
            },
            exit_code: if terminal { job.exit_code } else { 0 },
        }))
    }

    async fn stop_job(
        &self,
        req: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let principal = Self::caller(&req)?;
        let job = self.resolve_job(&principal, &req.get_ref().name)?;

        self.executor.stop(job.id).map_err(|err| {
            error!(id = %job.id, %err, "failed to stop job");
            to_status(err)
        })?;

        Ok(Response::new(StopJobResponse {}))
    }

    async fn watch_job_output(
        &self,
        req: Request<WatchJobOutputRequest>,
    ) -> Result<Response<Self::WatchJobOutputStream>, Status> {
        let principal = Self::caller(&req)?;
        let job = self.resolve_job(&principal, &req.get_ref().name)?;

        let mut reader = self.executor.open_reader(job.id).map_err(to_status)?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut scratch = vec![0u8; WATCH_CHUNK_SIZE];
            loop {
                tokio::select! {
                    // the caller hung up; release the blocked read and stop
                    _ = tx.closed() => {
                        reader.close();
                        return;
                    }
                    n = reader.read(&mut scratch) => {
                        if n == 0 {
                            // end-of-stream; dropping tx completes the RPC
                            return;
                        }
                        let chunk = JobOutput { data: scratch[..n].to_vec() };
                        if tx.send(Ok(chunk)).await.is_err() {
                            reader.close();
                            return;
                        }
                    }
                }
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::WatchJobOutputStream
        ))
    }
}

fn to_status(err: worklib::Error) -> Status {
    match err {
        worklib::Error::NotFound(_) => Status::not_found(err.to_string()),
        worklib::Error::InvalidState(_) => Status::failed_precondition(err.to_string()),
        worklib::Error::CannotStop | worklib::Error::BufferClosed => {
            Status::internal(err.to_string())
        }
    }
}

fn state_to_pb(state: worklib::JobState) -> protobuf::JobState {
    match state {
        worklib::JobState::Running => protobuf::JobState::Running,
        worklib::JobState::Completed => protobuf::JobState::Completed,
        worklib::JobState::Failed => protobuf::JobState::Failed,
        worklib::JobState::Stopped => protobuf::JobState::Stopped,
    }
}

fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
