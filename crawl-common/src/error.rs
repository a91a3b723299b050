use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("request depth {depth} exceeds task max depth {max}")]
    DepthLimit { depth: u32, max: u32 },

    #[error("task {0} is not registered")]
    UnknownTask(String),

    #[error("rule {rule} is not defined for task {task}")]
    UnknownRule { task: String, rule: String },

    #[error("fetch failed: {0}")]
    Fetch(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("script failed: {0}")]
    Script(String),

    #[error("storage error: {0}")]
    Storage(#[from] crawl_storage::StorageError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
