use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures scoped to a single request, room or session.
///
/// Capacity and duplicate rejections are not errors; saves report them as `false`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("no questions available to open a room")]
    NoQuestions,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("stored timestamp out of range: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
