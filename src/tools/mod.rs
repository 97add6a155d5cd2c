//! 工具箱：注册表、带超时与审计日志的执行器、echo 与离线 search

pub mod echo;
pub mod executor;
pub mod registry;
pub mod search;

pub use echo::EchoTool;
pub use executor::{AuditContext, ToolExecutor};
pub use registry::{Tool, ToolRegistry};
pub use search::{SearchHit, SearchTool};

/// 默认工具集：echo + search
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(SearchTool::new());
    registry
}
