use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table {0} cannot use itself as a reference table")]
    SelfReferenceTable(String),

    #[error("schema type {0} does not accept a reference table")]
    NotAReferenceSchema(String),

    #[error("unknown schema type: {0}")]
    UnknownSchemaType(String),

    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("no annotations found with ids {0:?}")]
    NoAnnotationsFound(Vec<i64>),

    #[error("annotation {id} was already superseded by {superseded_by}; update that row instead")]
    UpdateConflict { id: i64, superseded_by: i64 },

    #[error("segmentation rows already exist for ids {0:?}")]
    IdsExist(Vec<i64>),

    #[error("insert limit is {limit}, attempted to insert {attempted}")]
    InsertLimitExceeded { limit: usize, attempted: usize },

    #[error("annotation requires an 'id' to update the targeted row")]
    MissingId,

    #[error("invalid permission: {0}")]
    InvalidPermission(String),

    #[error("invalid value for column {column}: {reason}")]
    InvalidFieldValue { column: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
