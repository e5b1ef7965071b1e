pub mod service;
pub mod types;

pub use service::GenerationService;
pub use types::{
    FailedAttempt, FallbackNotice, GenerationCategory, GenerationFailure, GenerationInput,
    GenerationOutcome, GenerationPayload, GenerationRequest, OutcomeView,
};
