//! LLM 层：客户端抽象与 Mock 实现

pub mod mock;
pub mod traits;

pub use mock::{MockBehavior, MockLlmClient};
pub use traits::{LlmClient, LlmResponse, ToolCall};
