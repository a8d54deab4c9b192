use thiserror::Error;

/// Errors raised by the cache.
///
/// Metadata and structural errors abort the operation that hit them. Failures
/// while resolving a single property value are never represented here: they
/// are logged and the property is left unset.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no schema registered for type '{0}'")]
    MissingSchema(String),

    #[error("{type_name}: could not find store for index '{index}'")]
    MissingIndex { type_name: String, index: String },

    #[error("invalid reference type '{0}', expected STRONG, SOFT or WEAK")]
    InvalidReferenceType(String),

    #[error("invalid data level '{0}', expected HIGH or LOW")]
    InvalidLevel(String),

    #[error("invalid sub-class mapping operator '{0}'")]
    InvalidOperator(String),

    #[error("type '{0}' does not declare a primary key")]
    MissingPrimaryKey(String),

    #[error("no bean factory type registered under '{0}'")]
    UnknownFactoryType(String),

    #[error("{type_name}: primary key or indices not part of statement, missing one of [{columns}]")]
    MissingKeyColumns { type_name: String, columns: String },

    #[error("invalid schema for '{type_name}': {reason}")]
    InvalidSchema { type_name: String, reason: String },

    #[error("{type_name}: cannot replace an existing indexed entry with a new indexed entry for index '{index}'")]
    IndexedEntryReplaced { type_name: String, index: String },

    #[error("invalid put into {factory_type}, value type is {value_type}, key is {key}")]
    FactoryTypeMismatch {
        factory_type: String,
        value_type: String,
        key: String,
    },

    #[error("bean factory registry is no longer available")]
    RegistryUnavailable,

    #[error("data source error: {0}")]
    Source(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("schema parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
