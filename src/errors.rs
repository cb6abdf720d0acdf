use thiserror::Error;

/// Errors that can occur while indexing sources or serving MCP requests.
#[derive(Error, Debug)]
pub enum XmlGraphError {
    #[error("xml error: {message} (path: {path}, position: {position})")]
    Xml {
        message: String,
        path: String,
        position: u64,
    },

    #[error("source error: {message} (path: {path})")]
    Source { message: String, path: String },

    #[error("config error: {message}")]
    Config { message: String },

    #[error("tool error: {message}")]
    Tool { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Convenience alias for results using `XmlGraphError`.
pub type Result<T> = std::result::Result<T, XmlGraphError>;
