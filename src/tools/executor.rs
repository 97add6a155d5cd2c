//! 受监管的工具执行
//!
//! 每次调用都带一个 AuditContext（会话、步数、发起方），执行在统一超时内进行，
//! 结束后输出一条 guarded_tool_audit 日志（JSON）。发起方是模型本身或某个协议覆盖，
//! 便于事后区分「模型选的工具」与「监管层强制的工具」。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::protocols::OverrideAction;
use crate::tools::ToolRegistry;

const ARGS_PREVIEW_CHARS: usize = 200;

/// 一次工具调用的审计上下文
#[derive(Clone, Copy, Debug)]
pub struct AuditContext<'a> {
    pub session_id: &'a str,
    pub step: u32,
    /// None 表示模型自己选择的工具
    pub forced_by: Option<OverrideAction>,
}

impl AuditContext<'_> {
    fn initiator(&self) -> &'static str {
        self.forced_by.map_or("model", |a| a.as_str())
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &AuditContext<'_>,
    ) -> Result<String, AgentError> {
        let start = Instant::now();
        let args_preview = preview(&args.to_string());
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (outcome, output_chars) = match &result {
            Ok(Ok(out)) => ("ok", out.chars().count()),
            Ok(Err(_)) => ("error", 0),
            Err(_) => ("timeout", 0),
        };
        let audit = serde_json::json!({
            "event": "guarded_tool_audit",
            "session_id": ctx.session_id,
            "step": ctx.step,
            "tool": tool_name,
            "initiated_by": ctx.initiator(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "output_chars": output_chars,
            "args_preview": args_preview,
        });
        if outcome == "ok" {
            tracing::info!(audit = %audit, "tool");
        } else {
            tracing::warn!(audit = %audit, "tool");
        }

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 已注册工具名（有序）
    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}
