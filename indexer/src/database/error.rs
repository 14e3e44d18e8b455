use diesel::result::{ConnectionError, Error as PgError};
use r2d2::Error as PoolError;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Database(PgError),
    PostgresConnection(ConnectionError),
    Pool(PoolError),
    Serialization(serde_json::Error),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<PgError> for Error {
    fn from(e: PgError) -> Self {
        Error::Database(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::PostgresConnection(e)
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Error::Pool(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e)
    }
}
