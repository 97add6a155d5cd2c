//! 错误类型
//!
//! - LedgerError：账本存储层错误（SQLite / 锁中毒 / 数据损坏）
//! - GuardError：监管核心错误；Ledger 变体是单轮可恢复错误，UnmappedState 是致命配置错误
//! - AgentError：外层控制循环错误（LLM、工具、取消）

use thiserror::Error;

use crate::core::CriticalState;

/// 行动账本读写失败
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Ledger lock poisoned")]
    Poisoned,

    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),
}

/// 监管核心错误
#[derive(Error, Debug)]
pub enum GuardError {
    /// 账本 I/O 失败：只影响当前轮，调用方可重试或跳过本轮
    #[error("Ledger unavailable for this turn: {0}")]
    Ledger(#[from] LedgerError),

    /// 非 NONE 类别缺少协议处理器
    #[error("No protocol handler registered for critical state {0}")]
    UnmappedState(CriticalState),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl GuardError {
    /// 是否只影响当前轮（会话可以继续）
    pub fn is_turn_scoped(&self) -> bool {
        matches!(self, GuardError::Ledger(_))
    }
}

/// 控制循环运行中的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Cancelled")]
    Cancelled,
}
