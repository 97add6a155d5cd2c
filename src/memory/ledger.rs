//! 行动账本：会话隔离、只追加的历史记录
//!
//! 每条 ActionRecord 写入后不可变；同一 session 内按 sequence 单调递增排序，不同 session 互不可见。
//! 循环检测依赖精确的时间顺序，因此 recent() 必须看到该 session 之前的全部写入。

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::LedgerError;

/// 单次行动记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// 会话内序号，从 1 开始
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub args_signature: String,
    pub result_summary: String,
    pub tokens_consumed: u64,
    pub session_id: String,
}

impl ActionRecord {
    pub fn signature(&self) -> Signature {
        Signature::new(self.tool.clone(), self.args_signature.clone())
    }
}

/// (tool, args) 对，循环检测中的相等性单位
///
/// 同一工具但参数不同视为不同签名。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub tool: String,
    pub args: String,
}

impl Signature {
    pub fn new(tool: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: args.into(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tool, self.args)
    }
}

/// 账本存储接口：追加、按会话有序查询、聚合查询
///
/// 实现必须按 session 串行化读写；跨 session 可并发。
pub trait ActionLedger: Send + Sync {
    /// 追加一条记录，分配该 session 的下一个序号
    fn record(
        &self,
        tool: &str,
        args: &str,
        result: &str,
        tokens: u64,
        session_id: &str,
    ) -> Result<ActionRecord, LedgerError>;

    /// 最近 n 条记录，最新在前；历史不足时返回更少，空历史返回空 Vec
    fn recent(&self, session_id: &str, n: usize) -> Result<Vec<ActionRecord>, LedgerError>;

    /// 该 session 累计消耗的 token
    fn token_usage(&self, session_id: &str) -> Result<u64, LedgerError>;

    /// 该 session 的记录条数
    fn action_count(&self, session_id: &str) -> Result<usize, LedgerError>;

    /// 最近 n 条记录的签名，最新在前
    fn recent_signatures(&self, session_id: &str, n: usize) -> Result<Vec<Signature>, LedgerError> {
        Ok(self
            .recent(session_id, n)?
            .iter()
            .map(ActionRecord::signature)
            .collect())
    }
}

/// 内存账本：session_id -> 按序号排列的记录
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    sessions: RwLock<HashMap<String, Vec<ActionRecord>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionLedger for InMemoryLedger {
    fn record(
        &self,
        tool: &str,
        args: &str,
        result: &str,
        tokens: u64,
        session_id: &str,
    ) -> Result<ActionRecord, LedgerError> {
        let mut sessions = self.sessions.write().map_err(|_| LedgerError::Poisoned)?;
        let records = sessions.entry(session_id.to_string()).or_default();
        let record = ActionRecord {
            sequence: records.len() as u64 + 1,
            timestamp: Utc::now(),
            tool: tool.to_string(),
            args_signature: args.to_string(),
            result_summary: result.to_string(),
            tokens_consumed: tokens,
            session_id: session_id.to_string(),
        };
        records.push(record.clone());
        Ok(record)
    }

    fn recent(&self, session_id: &str, n: usize) -> Result<Vec<ActionRecord>, LedgerError> {
        let sessions = self.sessions.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(sessions
            .get(session_id)
            .map(|records| records.iter().rev().take(n).cloned().collect())
            .unwrap_or_default())
    }

    fn token_usage(&self, session_id: &str) -> Result<u64, LedgerError> {
        let sessions = self.sessions.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(sessions
            .get(session_id)
            .map(|records| records.iter().map(|r| r.tokens_consumed).sum())
            .unwrap_or(0))
    }

    fn action_count(&self, session_id: &str) -> Result<usize, LedgerError> {
        let sessions = self.sessions.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(sessions.get(session_id).map(Vec::len).unwrap_or(0))
    }
}
