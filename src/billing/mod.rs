// Admission control and usage metering

pub mod admission;
pub mod metering;
pub mod pricing;

pub use admission::{Admission, AdmissionController, AdmissionDecision, BalanceCheck};
pub use metering::{Charge, MeteringUnit, Settlement};
pub use pricing::{default_prices, ModelPrice, PricingTable, DEFAULT_MESSAGE_COST};
