use thiserror::Error;

use crawl_coordination::CoordError;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("no node to assign")]
    NoWorker,

    #[error("resource {0} not found")]
    NotFound(String),

    #[error("coordination error: {0}")]
    Coord(#[from] CoordError),
}

pub type Result<T> = std::result::Result<T, MasterError>;
