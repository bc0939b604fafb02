pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::LedgerError;
pub use sqlite::SqliteLedger;
pub use traits::*;
