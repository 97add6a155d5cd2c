//! 协议注册表：CriticalState → ProtocolHandler 的查找表，启动时构建
//!
//! 处理器本身不持有可变状态；DEADLOCK 的尝试计数放在调用方按会话保存的 ProtocolState 里。
//! 五个非 NONE 类别必须全部注册，缺失视为致命配置错误。

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::ProtocolsSection;
use crate::core::{CriticalState, GuardError, StateDetection};

/// 覆盖动作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    ForceDifferentTool,
    /// 终止信号：立即基于现有信息给出答案
    ForceSynthesis,
    TankMode,
    ForceDeeperResearch,
    /// 终止信号：立即综合并附上资源不足的说明
    ImmediateSynthesis,
    IntegrateContradiction,
}

impl OverrideAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideAction::ForceDifferentTool => "force_different_tool",
            OverrideAction::ForceSynthesis => "force_synthesis",
            OverrideAction::TankMode => "tank_mode",
            OverrideAction::ForceDeeperResearch => "force_deeper_research",
            OverrideAction::ImmediateSynthesis => "immediate_synthesis",
            OverrideAction::IntegrateContradiction => "integrate_contradiction",
        }
    }

    /// 调用方收到后必须结束研究、产出最终答案
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OverrideAction::ForceSynthesis | OverrideAction::ImmediateSynthesis
        )
    }
}

impl fmt::Display for OverrideAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协议处理结果
#[derive(Clone, Debug, Serialize)]
pub struct ProtocolResponse {
    pub override_action: OverrideAction,
    pub reasoning: String,
    pub metadata: Map<String, Value>,
}

impl ProtocolResponse {
    fn new(action: OverrideAction, reasoning: String) -> Self {
        Self {
            override_action: action,
            reasoning,
            metadata: Map::new(),
        }
    }

    fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// 每会话的协议状态；不得跨会话共享
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProtocolState {
    pub deadlock_attempts: u32,
}

impl ProtocolState {
    pub fn reset(&mut self) {
        self.deadlock_attempts = 0;
    }
}

/// 各类别的处理器（带参数的标签联合）
#[derive(Clone, Debug)]
pub enum ProtocolHandler {
    /// 前 force_after - 1 次换工具，此后强制综合
    Deadlock { force_after: u32 },
    /// tank mode：只允许保守来源，且需多来源共识
    Panic {
        sources: Vec<String>,
        min_consensus: usize,
    },
    Hubris { min_sources: usize },
    Scarcity { caveat: String },
    Novelty,
}

impl ProtocolHandler {
    /// 处理器负责的类别
    pub fn state(&self) -> CriticalState {
        match self {
            ProtocolHandler::Deadlock { .. } => CriticalState::Deadlock,
            ProtocolHandler::Panic { .. } => CriticalState::Panic,
            ProtocolHandler::Hubris { .. } => CriticalState::Hubris,
            ProtocolHandler::Scarcity { .. } => CriticalState::Scarcity,
            ProtocolHandler::Novelty => CriticalState::Novelty,
        }
    }

    pub fn handle(&self, detection: &StateDetection, state: &mut ProtocolState) -> ProtocolResponse {
        let meta = |key: &str| detection.metadata.get(key).cloned().unwrap_or(Value::Null);

        match self {
            ProtocolHandler::Deadlock { force_after } => {
                state.deadlock_attempts += 1;
                let attempt = state.deadlock_attempts;
                let response = if attempt >= *force_after {
                    ProtocolResponse::new(
                        OverrideAction::ForceSynthesis,
                        format!(
                            "DEADLOCK: Repeated loop {attempt} times. Synthesizing with current knowledge."
                        ),
                    )
                } else {
                    ProtocolResponse::new(
                        OverrideAction::ForceDifferentTool,
                        format!(
                            "DEADLOCK: Breaking loop (attempt {attempt}). Trying different approach."
                        ),
                    )
                };
                response
                    .with_meta("attempt", attempt)
                    .with_meta("loop_pattern", meta("pattern"))
                    .with_meta("sequence", meta("sequence"))
            }
            ProtocolHandler::Panic {
                sources,
                min_consensus,
            } => ProtocolResponse::new(
                OverrideAction::TankMode,
                format!(
                    "PANIC: High confusion detected ({:.0}%). Switching to conservative sources.",
                    detection.confidence * 100.0
                ),
            )
            .with_meta("allowed_sources", json!(sources))
            .with_meta("require_consensus", true)
            .with_meta("min_consensus_sources", *min_consensus),
            ProtocolHandler::Hubris { min_sources } => {
                let steps = detection
                    .metadata
                    .get("steps_taken")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                ProtocolResponse::new(
                    OverrideAction::ForceDeeperResearch,
                    format!(
                        "HUBRIS: Too confident after only {steps} steps. Seeking more sources and contrary views."
                    ),
                )
                .with_meta("require_additional_sources", *min_sources)
                .with_meta("seek_contrary_evidence", true)
                .with_meta("steps_so_far", steps)
            }
            ProtocolHandler::Scarcity { caveat } => {
                let ratio = |key: &str| {
                    detection
                        .metadata
                        .get(key)
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)
                };
                ProtocolResponse::new(
                    OverrideAction::ImmediateSynthesis,
                    format!(
                        "SCARCITY: Low resources ({:.0}% tokens, {:.0}% steps). Synthesizing now.",
                        ratio("token_ratio") * 100.0,
                        ratio("step_ratio") * 100.0
                    ),
                )
                .with_meta("add_caveat", true)
                .with_meta("caveat_text", caveat.clone())
            }
            ProtocolHandler::Novelty => ProtocolResponse::new(
                OverrideAction::IntegrateContradiction,
                "NOVELTY: Contradictory information detected. Re-evaluating all sources.".to_string(),
            )
            .with_meta("rerank_sources", true)
            .with_meta("flag_contradiction", true)
            .with_meta("update_confidence", true)
            .with_meta("contradiction", meta("contradiction")),
        }
    }
}

/// 类别 → 处理器 查找表
#[derive(Clone, Debug)]
pub struct ProtocolRegistry {
    handlers: HashMap<CriticalState, ProtocolHandler>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::from_config(&ProtocolsSection::default())
    }
}

impl ProtocolRegistry {
    /// 按配置注册全部五个处理器
    pub fn from_config(config: &ProtocolsSection) -> Self {
        let handlers = [
            ProtocolHandler::Scarcity {
                caveat: config.scarcity_caveat.clone(),
            },
            ProtocolHandler::Deadlock {
                force_after: config.deadlock_force_after,
            },
            ProtocolHandler::Panic {
                sources: config.conservative_sources.clone(),
                min_consensus: config.min_consensus_sources,
            },
            ProtocolHandler::Hubris {
                min_sources: config.hubris_min_sources,
            },
            ProtocolHandler::Novelty,
        ];
        Self {
            handlers: handlers.into_iter().map(|h| (h.state(), h)).collect(),
        }
    }

    /// 自定义处理器集合；必须覆盖所有非 NONE 类别，重复注册时后者覆盖前者
    pub fn with_handlers(
        handlers: impl IntoIterator<Item = ProtocolHandler>,
    ) -> Result<Self, GuardError> {
        let handlers: HashMap<_, _> = handlers.into_iter().map(|h| (h.state(), h)).collect();
        if let Some(missing) = CriticalState::CRITICAL
            .iter()
            .find(|s| !handlers.contains_key(s))
        {
            return Err(GuardError::UnmappedState(*missing));
        }
        Ok(Self { handlers })
    }

    /// NONE 返回 Ok(None)（放行）；未注册的类别返回 UnmappedState
    pub fn dispatch(
        &self,
        detection: &StateDetection,
        state: &mut ProtocolState,
    ) -> Result<Option<ProtocolResponse>, GuardError> {
        if !detection.is_active() {
            return Ok(None);
        }
        let handler = self
            .handlers
            .get(&detection.state)
            .ok_or(GuardError::UnmappedState(detection.state))?;
        let response = handler.handle(detection, state);
        tracing::info!(
            state = %detection.state,
            action = %response.override_action,
            reasoning = %response.reasoning,
            "protocol override"
        );
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadlock() -> StateDetection {
        StateDetection::new(CriticalState::Deadlock, 1.0, "DEADLOCK: Exact repetition")
            .with_meta("pattern", "EXACT_REPEAT")
    }

    #[test]
    fn test_deadlock_escalates_to_synthesis() {
        let registry = ProtocolRegistry::default();
        let mut state = ProtocolState::default();
        let actions: Vec<_> = (0..3)
            .map(|_| {
                registry
                    .dispatch(&deadlock(), &mut state)
                    .unwrap()
                    .unwrap()
                    .override_action
            })
            .collect();
        assert_eq!(
            actions,
            vec![
                OverrideAction::ForceDifferentTool,
                OverrideAction::ForceDifferentTool,
                OverrideAction::ForceSynthesis
            ]
        );
        assert!(actions[2].is_terminal());
    }

    #[test]
    fn test_deadlock_counter_is_per_state() {
        let registry = ProtocolRegistry::default();
        let mut a = ProtocolState::default();
        let mut b = ProtocolState::default();
        registry.dispatch(&deadlock(), &mut a).unwrap();
        registry.dispatch(&deadlock(), &mut a).unwrap();
        let first_b = registry.dispatch(&deadlock(), &mut b).unwrap().unwrap();
        assert_eq!(first_b.override_action, OverrideAction::ForceDifferentTool);
        assert_eq!(a.deadlock_attempts, 2);
        assert_eq!(b.deadlock_attempts, 1);
    }

    #[test]
    fn test_none_passes_through() {
        let registry = ProtocolRegistry::default();
        let mut state = ProtocolState::default();
        assert!(registry
            .dispatch(&StateDetection::nominal(), &mut state)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_each_category_maps_to_its_action() {
        let registry = ProtocolRegistry::default();
        let mut state = ProtocolState::default();
        let cases = [
            (CriticalState::Panic, OverrideAction::TankMode),
            (CriticalState::Hubris, OverrideAction::ForceDeeperResearch),
            (CriticalState::Scarcity, OverrideAction::ImmediateSynthesis),
            (CriticalState::Novelty, OverrideAction::IntegrateContradiction),
        ];
        for (critical, expected) in cases {
            let detection = StateDetection::new(critical, 0.9, "x");
            let response = registry.dispatch(&detection, &mut state).unwrap().unwrap();
            assert_eq!(response.override_action, expected);
        }
        // 无状态处理器不动计数
        assert_eq!(state.deadlock_attempts, 0);
    }

    #[test]
    fn test_panic_metadata_lists_sources() {
        let registry = ProtocolRegistry::default();
        let response = registry
            .dispatch(
                &StateDetection::new(CriticalState::Panic, 0.9, "x"),
                &mut ProtocolState::default(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            response.metadata["allowed_sources"],
            json!(["wikipedia", "arxiv", "official_docs"])
        );
        assert_eq!(response.metadata["require_consensus"], json!(true));
    }

    #[test]
    fn test_scarcity_carries_caveat() {
        let registry = ProtocolRegistry::default();
        let response = registry
            .dispatch(
                &StateDetection::new(CriticalState::Scarcity, 1.0, "x").with_meta("step_ratio", 1.0),
                &mut ProtocolState::default(),
            )
            .unwrap()
            .unwrap();
        assert!(response.override_action.is_terminal());
        assert!(response.reasoning.contains("100% steps"));
        assert!(response.metadata["caveat_text"]
            .as_str()
            .unwrap()
            .contains("Limited resources"));
    }

    #[test]
    fn test_missing_handler_is_rejected() {
        let err = ProtocolRegistry::with_handlers([
            ProtocolHandler::Deadlock { force_after: 3 },
            ProtocolHandler::Novelty,
        ])
        .unwrap_err();
        assert!(matches!(err, GuardError::UnmappedState(CriticalState::Scarcity)));
    }

    #[test]
    fn test_custom_force_after() {
        let registry = ProtocolRegistry::with_handlers([
            ProtocolHandler::Scarcity { caveat: String::new() },
            ProtocolHandler::Deadlock { force_after: 1 },
            ProtocolHandler::Panic { sources: vec![], min_consensus: 1 },
            ProtocolHandler::Hubris { min_sources: 1 },
            ProtocolHandler::Novelty,
        ])
        .unwrap();
        let response = registry
            .dispatch(&deadlock(), &mut ProtocolState::default())
            .unwrap()
            .unwrap();
        assert_eq!(response.override_action, OverrideAction::ForceSynthesis);
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut state = ProtocolState { deadlock_attempts: 4 };
        state.reset();
        assert_eq!(state.deadlock_attempts, 0);
    }
}
