use std::result;

use uuid::Uuid;

use crate::job::JobState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no job found with id '{0}'")]
    NotFound(Uuid),
    #[error("invalid state '{0}'")]
    InvalidState(JobState),
    #[error("cannot stop process")]
    CannotStop,
    #[error("write on closed buffer")]
    BufferClosed,
}

pub type Result<T> = result::Result<T, Error>;
