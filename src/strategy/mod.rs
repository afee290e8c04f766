//! Strategy layer: odds math, arbitrage scanning, Kelly sizing, and the
//! rule-based risk manager. Everything here is synchronous and free of I/O.

pub mod arbitrage;
pub mod kelly;
pub mod odds;
pub mod risk;
pub mod rules;

pub use arbitrage::{BatchScan, OpportunityScanner, ScanFilters, ScannerConfig};
pub use kelly::{KellyCalculator, KellyConfig};
pub use risk::{RiskContext, RiskLimits, RiskManager, RiskRule, ValidationResult};
