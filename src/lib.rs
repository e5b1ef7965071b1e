pub mod app;
pub mod billing;
pub mod error;
pub mod generation;
pub mod models;
pub mod platform;
pub mod routing;
pub mod storage;

pub use error::{Error, Result};
pub use generation::{GenerationOutcome, GenerationRequest, GenerationService};
