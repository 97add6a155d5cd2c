//! 核心层：错误类型、状态分类、会话监管

pub mod error;
pub mod state;
pub mod supervisor;

pub use error::{AgentError, GuardError, LedgerError};
pub use state::{CriticalState, StateDetection};
pub use supervisor::{SessionGuard, Supervisor, TurnOutcome, Verdict};
