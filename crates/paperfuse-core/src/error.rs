use thiserror::Error;

use crate::paper::PaperId;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown paper: {0}")]
    UnknownPaper(PaperId),
}

pub type Result<T> = std::result::Result<T, CoreError>;
