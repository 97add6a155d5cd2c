//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HARDENED__*` 覆盖（双下划线表示嵌套，如 `HARDENED__CIRCUIT_BREAKER__MAX_CONSECUTIVE=5`）。
//! 不存在全局单例：加载并校验后的 AppConfig 以引用传给各组件的构造函数。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::GuardError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub protocols: ProtocolsSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
}

/// [agent] 段：步数 / token 预算与工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_steps() -> u32 {
    10
}

fn default_token_budget() -> u64 {
    1000
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            token_budget: default_token_budget(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [monitor] 段：分类阈值
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    /// 步数或 token 使用率超过该值即 SCARCITY
    #[serde(default = "default_scarcity_threshold")]
    pub scarcity_threshold: f64,
    /// 文本置信度低于该值即 PANIC
    #[serde(default = "default_panic_threshold")]
    pub panic_threshold: f64,
    /// 早期步骤文本置信度高于该值即 HUBRIS
    #[serde(default = "default_hubris_threshold")]
    pub hubris_threshold: f64,
    /// 视为「早期」的最大步数
    #[serde(default = "default_hubris_max_steps")]
    pub hubris_max_steps: u32,
    #[serde(default = "default_deadlock_window")]
    pub deadlock_window: usize,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
}

fn default_scarcity_threshold() -> f64 {
    0.9
}

fn default_panic_threshold() -> f64 {
    0.4
}

fn default_hubris_threshold() -> f64 {
    0.9
}

fn default_hubris_max_steps() -> u32 {
    2
}

fn default_deadlock_window() -> usize {
    5
}

fn default_loop_threshold() -> usize {
    3
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            scarcity_threshold: default_scarcity_threshold(),
            panic_threshold: default_panic_threshold(),
            hubris_threshold: default_hubris_threshold(),
            hubris_max_steps: default_hubris_max_steps(),
            deadlock_window: default_deadlock_window(),
            loop_threshold: default_loop_threshold(),
        }
    }
}

/// [circuit_breaker] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
}

fn default_max_consecutive() -> usize {
    3
}

fn default_max_total() -> usize {
    10
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            max_consecutive: default_max_consecutive(),
            max_total: default_max_total(),
        }
    }
}

/// [protocols] 段：各覆盖协议的参数
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolsSection {
    /// DEADLOCK 第几次处理起改为强制综合
    #[serde(default = "default_deadlock_force_after")]
    pub deadlock_force_after: u32,
    /// PANIC（tank mode）下允许的保守来源
    #[serde(default = "default_conservative_sources")]
    pub conservative_sources: Vec<String>,
    #[serde(default = "default_min_consensus_sources")]
    pub min_consensus_sources: usize,
    /// HUBRIS 要求追加的最少来源数
    #[serde(default = "default_hubris_min_sources")]
    pub hubris_min_sources: usize,
    #[serde(default = "default_scarcity_caveat")]
    pub scarcity_caveat: String,
}

fn default_deadlock_force_after() -> u32 {
    3
}

fn default_conservative_sources() -> Vec<String> {
    vec!["wikipedia".into(), "arxiv".into(), "official_docs".into()]
}

fn default_min_consensus_sources() -> usize {
    2
}

fn default_hubris_min_sources() -> usize {
    3
}

fn default_scarcity_caveat() -> String {
    "Note: Limited resources prevented exhaustive research.".to_string()
}

impl Default for ProtocolsSection {
    fn default() -> Self {
        Self {
            deadlock_force_after: default_deadlock_force_after(),
            conservative_sources: default_conservative_sources(),
            min_consensus_sources: default_min_consensus_sources(),
            hubris_min_sources: default_hubris_min_sources(),
            scarcity_caveat: default_scarcity_caveat(),
        }
    }
}

/// 账本存储后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [ledger] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSection {
    #[serde(default)]
    pub backend: LedgerBackend,
    /// sqlite 后端的数据库文件
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("action_history.db")
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            path: default_ledger_path(),
        }
    }
}

/// [observability] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    /// RUST_LOG 未设置时使用的级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 运行结束后把 Prometheus 文本输出到 stderr
    #[serde(default)]
    pub print_metrics: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            print_metrics: false,
        }
    }
}

impl AppConfig {
    /// 校验阈值与上限；不合法时返回 GuardError::Config
    pub fn validate(&self) -> Result<(), GuardError> {
        let m = &self.monitor;
        for (name, value) in [
            ("monitor.scarcity_threshold", m.scarcity_threshold),
            ("monitor.panic_threshold", m.panic_threshold),
            ("monitor.hubris_threshold", m.hubris_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if m.loop_threshold < 2 {
            return Err(GuardError::Config(format!(
                "monitor.loop_threshold must be at least 2, got {}",
                m.loop_threshold
            )));
        }
        if m.deadlock_window == 0 {
            return Err(GuardError::Config("monitor.deadlock_window must be > 0".into()));
        }
        if self.circuit_breaker.max_consecutive == 0 || self.circuit_breaker.max_total == 0 {
            return Err(GuardError::Config(
                "circuit_breaker limits must be > 0".into(),
            ));
        }
        if self.protocols.deadlock_force_after == 0 {
            return Err(GuardError::Config(
                "protocols.deadlock_force_after must be > 0".into(),
            ));
        }
        if self.agent.max_steps == 0 {
            return Err(GuardError::Config("agent.max_steps must be > 0".into()));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HARDENED__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HARDENED__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HARDENED")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
