pub mod billing;
pub mod contracts;

pub use billing::BillingCalculator;
pub use contracts::{ContractLedger, ReserveOutcome};
