//! Echo 工具：把参数里的 text（或 query）原样返回，作为 DEADLOCK 时的替代行动

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let text = args
            .get("text")
            .or_else(|| args.get("query"))
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_falls_back_to_query() {
        assert_eq!(EchoTool.execute(json!({ "query": "q" })).await.unwrap(), "q");
        assert_eq!(EchoTool.execute(json!({})).await.unwrap(), "(empty)");
    }
}
