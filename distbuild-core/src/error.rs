use thiserror::Error;

/// Errors raised by the id-free, socket-free core types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("route map: outgoing id {0:?} not found")]
    RouteNotFound(String),

    #[error("route map: outgoing id {outgoing:?} already routed to {existing:?}, refusing to rebind to {incoming:?}")]
    RouteConflict {
        outgoing: String,
        existing: String,
        incoming: String,
    },

    #[error("artifact graph: malformed node: {0}")]
    MalformedArtifact(String),

    #[error("artifact graph: dangling dependency reference to cache_key {0:?}")]
    DanglingDependency(String),

    #[error("message: missing required field {0:?}")]
    MissingField(&'static str),

    #[error("message: unknown type {0:?}")]
    UnknownType(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
