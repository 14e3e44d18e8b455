use crate::consensus::ClientError;
use crate::database;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Client(ClientError),
    Database(database::Error),
    Decode(ssz::DecodeError),
    /// Required data cannot be produced right now (e.g. no archive client
    /// can serve the state). The caller skips and retries later.
    MissingData(String),
    /// A broken invariant; the controller loop restarts on these.
    Fatal(String),
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        Error::Client(e)
    }
}

impl From<database::Error> for Error {
    fn from(e: database::Error) -> Self {
        Error::Database(e)
    }
}

impl From<ssz::DecodeError> for Error {
    fn from(e: ssz::DecodeError) -> Self {
        Error::Decode(e)
    }
}
