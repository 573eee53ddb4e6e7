use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EthogramError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("table is not open")]
    TableNotOpen,

    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("property already exists: {0}")]
    PropertyExists(String),

    #[error("property not found: {0}")]
    PropertyNotFound(String),

    #[error("invalid property name: {0}")]
    InvalidPropertyName(String),

    #[error("factor not found: {property}: {detail}")]
    FactorNotFound { property: String, detail: String },

    #[error("factor key too large ({size} bytes, max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl EthogramError {
    /// True for the error kinds a caller can repair by changing its request
    /// (as opposed to store-level failures).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EthogramError::TableNotOpen
                | EthogramError::InvalidTableName(_)
                | EthogramError::TableExists(_)
                | EthogramError::TableNotFound(_)
                | EthogramError::PropertyExists(_)
                | EthogramError::PropertyNotFound(_)
                | EthogramError::InvalidPropertyName(_)
                | EthogramError::FactorNotFound { .. }
                | EthogramError::Query(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EthogramError>;
