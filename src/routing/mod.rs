pub mod classifier;
pub mod fallback;
pub mod resolver;

pub use classifier::{ErrorClassifier, ErrorKind};
pub use fallback::{
    default_chain, DispatchPolicy, FallbackCandidate, FallbackChain, FallbackRouter, SpeedTier,
};
pub use resolver::{default_routes, ModelResolver, ModelRoute, RouteTarget};
