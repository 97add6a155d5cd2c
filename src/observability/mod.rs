//! 可观测性：tracing 订阅器初始化与 Prometheus 指标
//!
//! RUST_LOG 优先；未设置时使用配置中的 observability.log_level。

pub mod metrics;

pub use metrics::{GuardMetrics, SessionMetrics};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或嵌入方可能已安装订阅器
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
