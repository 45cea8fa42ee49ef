pub mod ledger;

pub use ledger::{hash_path, HashLedger, LedgerEntry};
