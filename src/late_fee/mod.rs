pub mod distribution;
pub mod engine;

pub use distribution::FeeDistribution;
pub use engine::{InstallmentLateFee, LateFeeBreakdown, LateFeeCalculation, LateFeeEngine};
