//! Mock LLM 客户端（用于测试与演示，无需 API）
//!
//! 按 MockBehavior 返回确定性的回复，覆盖循环、困惑、过度自信、矛盾、耗尽 token 等对抗场景；
//! override_response 可替换第 n 次调用（从 1 开始）的回复，scripted 按顺序回放一组回复。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmResponse, ToolCall};

/// 预置行为
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// 第一次调用搜索，之后直接给出答案
    #[default]
    Normal,
    /// 每次都用相同参数搜索
    LoopForever,
    /// 满篇犹豫措辞
    Confused,
    /// 一开始就极度自信地给出答案
    Overconfident,
    /// 第 1、2 次调用带着相反结论去搜索，之后给出调和后的答案
    Contradictory,
    /// 每次消耗 2000 token
    TokenHeavy,
}

impl FromStr for MockBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(MockBehavior::Normal),
            "loop" | "loop_forever" => Ok(MockBehavior::LoopForever),
            "confused" => Ok(MockBehavior::Confused),
            "overconfident" => Ok(MockBehavior::Overconfident),
            "contradictory" => Ok(MockBehavior::Contradictory),
            "token_heavy" => Ok(MockBehavior::TokenHeavy),
            other => Err(format!("Unknown mock behavior: {other}")),
        }
    }
}

/// Mock 客户端：记录全部 prompt
#[derive(Debug, Default)]
pub struct MockLlmClient {
    behavior: MockBehavior,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    overrides: Mutex<HashMap<usize, LlmResponse>>,
}

impl MockLlmClient {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    /// 按顺序回放 responses，用完后退回 Normal 行为
    pub fn scripted(responses: impl IntoIterator<Item = LlmResponse>) -> Self {
        let mock = Self::new(MockBehavior::Normal);
        for (i, response) in responses.into_iter().enumerate() {
            mock.override_response(i + 1, response);
        }
        mock
    }

    /// 替换第 call_number 次调用（从 1 开始）的回复
    pub fn override_response(&self, call_number: usize, response: LlmResponse) {
        if let Ok(mut overrides) = self.overrides.lock() {
            overrides.insert(call_number, response);
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn response_for(&self, call: usize) -> LlmResponse {
        match self.behavior {
            MockBehavior::Normal if call == 1 => LlmResponse::with_tool(
                "Let me look this up first.",
                ToolCall::new("search", json!({ "query": "relevant query" })),
                100,
            ),
            MockBehavior::Normal => {
                LlmResponse::answer("Based on the search results, the answer is X.", 100)
            }
            MockBehavior::LoopForever => LlmResponse::with_tool(
                "I need more information to answer this question. Let me search for more details.",
                ToolCall::new("search", json!({ "query": "more information" })),
                50,
            ),
            MockBehavior::Confused => LlmResponse::with_tool(
                "I'm not sure about this. Maybe it could be X, or possibly Y. Perhaps Z? \
                 I don't have enough information to say with confidence.",
                ToolCall::new("search", json!({ "query": "clarification" })),
                80,
            ),
            MockBehavior::Overconfident => LlmResponse::answer(
                "The answer is clearly X. I am absolutely sure, this is definitely correct.",
                60,
            ),
            MockBehavior::Contradictory if call == 1 => LlmResponse::with_tool(
                "Coffee is harmful. Research indicates serious health risks.",
                ToolCall::new("search", json!({ "query": "coffee health effects" })),
                70,
            ),
            MockBehavior::Contradictory if call == 2 => LlmResponse::with_tool(
                "Coffee is definitely healthy. Studies show clear benefits.",
                ToolCall::new("search", json!({ "query": "coffee health effects" })),
                70,
            ),
            MockBehavior::Contradictory => LlmResponse::answer(
                "Weighing both studies together, moderate coffee intake is fine for most adults.",
                70,
            ),
            MockBehavior::TokenHeavy => LlmResponse::answer(
                "Let me provide an extremely detailed analysis with lots of words. ".repeat(50),
                2000,
            ),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, prompt: &str) -> Result<LlmResponse, String> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let overridden = self
            .overrides
            .lock()
            .map_err(|_| "mock overrides lock poisoned".to_string())?
            .get(&call)
            .cloned();
        Ok(overridden.unwrap_or_else(|| self.response_for(call)))
    }
}
