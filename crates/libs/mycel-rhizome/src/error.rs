use mycel_identity::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum RhizomeError {
    #[error("parse: {0}")]
    Parse(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("store needs {needed} more bytes than it can free")]
    NoSpace { needed: u64 },

    #[error("not found")]
    NotFound,

    #[error("a newer version of this bundle is already stored")]
    Stale,

    #[error("this version of the bundle is already stored")]
    AlreadyPresent,

    #[error("peer protocol violation: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,

    #[error("db: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
}
