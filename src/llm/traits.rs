//! LLM 客户端抽象
//!
//! 监管核心从不直接调用模型；控制循环通过 LlmClient 取得每步的文本与（可选的）工具调用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 模型提出的工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// 单次调用结果：文本、可选工具调用、本次消耗的 token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub tool_call: Option<ToolCall>,
    pub tokens_used: u64,
}

impl LlmResponse {
    pub fn answer(content: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            content: content.into(),
            tool_call: None,
            tokens_used,
        }
    }

    pub fn with_tool(content: impl Into<String>, call: ToolCall, tokens_used: u64) -> Self {
        Self {
            content: content.into(),
            tool_call: Some(call),
            tokens_used,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<LlmResponse, String>;
}
