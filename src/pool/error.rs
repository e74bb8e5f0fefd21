/// Pool error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}
impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self(err.into()),
        }
    }
}

impl Error {
    /// The underlying failure, e.g. a `lapin::Error` or a connection error.
    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}
