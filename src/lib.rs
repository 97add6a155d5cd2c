//! Hardened Agent - 自主智能体的监管安全层
//!
//! 模块划分：
//! - **agent**: 在监管下运行的控制循环（HardenedAgent）与事件流
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **core**: 错误类型、CriticalState 分类、按会话的 Supervisor
//! - **llm**: LLM 客户端抽象与对抗场景 Mock
//! - **memory**: 会话隔离的行动账本（内存 / SQLite）
//! - **monitoring**: 循环检测、文本置信度、优先级裁决、熔断器、Silver Gauge
//! - **observability**: tracing 初始化与 Prometheus 指标
//! - **protocols**: 各类别的确定性覆盖协议
//! - **tools**: 工具注册表、执行器、echo / search

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod monitoring;
pub mod observability;
pub mod protocols;
pub mod tools;

pub use agent::{GuardEvent, HardenedAgent, RunOutcome, RunReport};
pub use config::{load_config, AppConfig};
pub use core::{CriticalState, GuardError, StateDetection, Supervisor, TurnOutcome, Verdict};
