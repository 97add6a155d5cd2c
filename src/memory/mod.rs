//! 记忆层：会话隔离的行动账本（内存 / SQLite）

pub mod ledger;
pub mod sqlite_ledger;

pub use ledger::{ActionLedger, ActionRecord, InMemoryLedger, Signature};
pub use sqlite_ledger::SqliteLedger;
