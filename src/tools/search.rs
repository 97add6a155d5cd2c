//! Search 工具：离线的固定语料检索
//!
//! 结果带来源标签；args.sources 给出时只返回白名单来源（PANIC 的 tank mode 用）。
//! 输出超过 max_result_chars 时截断并追加 ...[truncated]。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

const DEFAULT_MAX_RESULT_CHARS: usize = 2000;

/// 一条检索结果
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub source: String,
    pub title: String,
    pub snippet: String,
}

impl SearchHit {
    pub fn new(source: &str, title: &str, snippet: &str) -> Self {
        Self {
            source: source.to_string(),
            title: title.to_string(),
            snippet: snippet.to_string(),
        }
    }
}

fn default_corpus() -> Vec<SearchHit> {
    vec![
        SearchHit::new("wikipedia", "Overview", "General background on the topic from an encyclopedia entry."),
        SearchHit::new("arxiv", "Survey paper", "A peer-reviewed survey summarising current research."),
        SearchHit::new("official_docs", "Reference manual", "Authoritative reference documentation."),
        SearchHit::new("blog", "Opinion piece", "An informal take with unverified claims."),
        SearchHit::new("forum", "Discussion thread", "Community answers of mixed quality."),
    ]
}

pub struct SearchTool {
    corpus: Vec<SearchHit>,
    max_result_chars: usize,
}

impl Default for SearchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchTool {
    pub fn new() -> Self {
        Self::with_corpus(default_corpus())
    }

    pub fn with_corpus(corpus: Vec<SearchHit>) -> Self {
        Self {
            corpus,
            max_result_chars: DEFAULT_MAX_RESULT_CHARS,
        }
    }

    pub fn max_result_chars(mut self, n: usize) -> Self {
        self.max_result_chars = n;
        self
    }
}

fn truncate(s: String, max: usize) -> String {
    if s.chars().count() <= max {
        return s;
    }
    format!("{}...[truncated]", s.chars().take(max).collect::<String>())
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the knowledge base. Args: {\"query\": \"...\", \"sources\": [\"wikipedia\", ...] (optional)}"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or("Missing 'query' argument")?;

        let allowed: Option<HashSet<&str>> = args
            .get("sources")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().filter_map(|s| s.as_str()).collect());

        let lines: Vec<String> = self
            .corpus
            .iter()
            .filter(|hit| {
                allowed
                    .as_ref()
                    .map_or(true, |a| a.contains(hit.source.as_str()))
            })
            .map(|hit| format!("[{}] {}: {}", hit.source, hit.title, hit.snippet))
            .collect();

        if lines.is_empty() {
            return Ok(format!("No results for '{query}'"));
        }
        let body = format!("Results for '{query}':\n{}", lines.join("\n"));
        Ok(truncate(body, self.max_result_chars))
    }
}
