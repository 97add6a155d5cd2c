//! SQLite 行动账本（rusqlite，同步）
//!
//! 表 actions 以 (session_id, sequence) 唯一；分配序号与插入在同一个 IMMEDIATE 事务内完成，
//! 多个连接（或多个进程）同时追加时由 SQLite 写锁串行化，等待上限为 BUSY_TIMEOUT。
//! 单个连接由 Mutex 串行化，保证同一 session 的读一定能看到之前的全部写入。

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

use crate::core::LedgerError;
use crate::memory::{ActionLedger, ActionRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sequence INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    tool TEXT NOT NULL,
    args TEXT NOT NULL,
    result TEXT,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    session_id TEXT NOT NULL,
    UNIQUE (session_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_actions_session_sequence
    ON actions(session_id, sequence DESC);
";

/// 其他连接持有写锁时的最长等待
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 数据库中的整数列转为无符号值；负数视为损坏
fn non_negative<T: TryFrom<i64>>(value: i64, what: &str) -> Result<T, LedgerError> {
    T::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{what} {value}")))
}

/// 持久化账本：单连接 + Mutex
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

struct RawRow {
    sequence: i64,
    timestamp: String,
    tool: String,
    args: String,
    result: Option<String>,
    tokens: i64,
    session_id: String,
}

impl RawRow {
    fn into_record(self) -> Result<ActionRecord, LedgerError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| LedgerError::Corrupt(format!("timestamp '{}': {e}", self.timestamp)))?
            .with_timezone(&Utc);
        Ok(ActionRecord {
            sequence: non_negative(self.sequence, "sequence")?,
            timestamp,
            tool: self.tool,
            args_signature: self.args,
            result_summary: self.result.unwrap_or_default(),
            tokens_consumed: non_negative(self.tokens, "tokens_used")?,
            session_id: self.session_id,
        })
    }
}

impl ActionLedger for SqliteLedger {
    fn record(
        &self,
        tool: &str,
        args: &str,
        result: &str,
        tokens: u64,
        session_id: &str,
    ) -> Result<ActionRecord, LedgerError> {
        let mut conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM actions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let sequence = last + 1;
        let timestamp = Utc::now();
        tx.execute(
            "INSERT INTO actions (sequence, timestamp, tool, args, result, tokens_used, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sequence,
                timestamp.to_rfc3339(),
                tool,
                args,
                result,
                i64::try_from(tokens).unwrap_or(i64::MAX),
                session_id
            ],
        )?;
        tx.commit()?;

        Ok(ActionRecord {
            sequence: sequence as u64,
            timestamp,
            tool: tool.to_string(),
            args_signature: args.to_string(),
            result_summary: result.to_string(),
            tokens_consumed: tokens,
            session_id: session_id.to_string(),
        })
    }

    fn recent(&self, session_id: &str, n: usize) -> Result<Vec<ActionRecord>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT sequence, timestamp, tool, args, result, tokens_used, session_id
             FROM actions
             WHERE session_id = ?1
             ORDER BY sequence DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![session_id, limit], |row| {
                Ok(RawRow {
                    sequence: row.get(0)?,
                    timestamp: row.get(1)?,
                    tool: row.get(2)?,
                    args: row.get(3)?,
                    result: row.get(4)?,
                    tokens: row.get(5)?,
                    session_id: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    fn token_usage(&self, session_id: &str) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tokens_used), 0) FROM actions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        non_negative(total, "token total")
    }

    fn action_count(&self, session_id: &str) -> Result<usize, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM actions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        non_negative(count, "action count")
    }
}
