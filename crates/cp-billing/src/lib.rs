//! Pre-call estimate, idempotent charge, self-demoting operating modes,
//! tiered pricing cache, and end-of-run reconciliation.

pub mod error;
pub mod ledger;
pub mod pricing;
pub mod token_counter;

pub use error::{BillingError, Result};
pub use ledger::{BillingLedger, ChargeOutcome, LedgerConfig, OperatingMode};
pub use pricing::{PriceQuote, PricingCache, PricingSource, SharedPricingCache};
pub use token_counter::{ChatMessage, ContentPart, TokenCount, TokenCounter};
