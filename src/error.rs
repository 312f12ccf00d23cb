//! Error types for Sonoray

use crate::world::EmitterId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SonorayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown emitter: {0}")]
    UnknownEmitter(EmitterId),
}

pub type Result<T> = std::result::Result<T, SonorayError>;
