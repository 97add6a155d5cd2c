//! Prometheus 指标
//!
//! 每个 GuardMetrics 持有独立的 Registry（不注册到全局），Supervisor 与控制循环共享同一个实例：
//! - Supervisor：轮数、活跃类别、协议覆盖、熔断跳闸、当前类别
//! - HardenedAgent：运行结束方式、token 消耗、LLM 延迟
//!
//! 计数器命名遵循 Prometheus 约定（计数器以 _total 结尾，直方图带单位后缀）。

use std::collections::BTreeMap;

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use serde::Serialize;

use crate::core::CriticalState;
use crate::protocols::OverrideAction;

const TURNS: &str = "hardened_turns_total";
const CRITICAL_STATES: &str = "hardened_critical_states_total";
const OVERRIDES: &str = "hardened_protocol_overrides_total";
const TOKENS: &str = "hardened_tokens_total";

/// 单个会话的计数快照
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub turns: u64,
    pub tokens: u64,
    /// 按类别（小写名）计数，只含活跃类别
    pub critical_states: BTreeMap<String, u64>,
    /// 按覆盖动作计数
    pub overrides: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct GuardMetrics {
    registry: Registry,
    turns: IntCounterVec,
    critical_states: IntCounterVec,
    overrides: IntCounterVec,
    breaker_trips: IntCounterVec,
    runs_completed: IntCounterVec,
    tokens: IntCounterVec,
    current_state: IntGaugeVec,
    llm_latency: Histogram,
}

impl GuardMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let turns = IntCounterVec::new(
            Opts::new(TURNS, "Turns evaluated by the supervisor."),
            &["session_id"],
        )?;
        let critical_states = IntCounterVec::new(
            Opts::new(CRITICAL_STATES, "Active critical state classifications."),
            &["state", "session_id"],
        )?;
        let overrides = IntCounterVec::new(
            Opts::new(OVERRIDES, "Protocol overrides issued."),
            &["action", "session_id"],
        )?;
        let breaker_trips = IntCounterVec::new(
            Opts::new("hardened_breaker_trips_total", "Circuit breaker trips."),
            &["reason"],
        )?;
        let runs_completed = IntCounterVec::new(
            Opts::new("hardened_runs_completed_total", "Agent runs by terminal outcome."),
            &["outcome"],
        )?;
        let tokens = IntCounterVec::new(
            Opts::new(TOKENS, "Tokens consumed by the model."),
            &["session_id"],
        )?;
        let current_state = IntGaugeVec::new(
            Opts::new(
                "hardened_current_state",
                "Latest classification (0=none 1=deadlock 2=panic 3=hubris 4=scarcity 5=novelty).",
            ),
            &["session_id"],
        )?;
        let llm_latency = Histogram::with_opts(
            HistogramOpts::new("hardened_llm_latency_seconds", "Latency of model calls.")
                .buckets(exponential_buckets(0.001, 2.0, 15)?),
        )?;

        registry.register(Box::new(turns.clone()))?;
        registry.register(Box::new(critical_states.clone()))?;
        registry.register(Box::new(overrides.clone()))?;
        registry.register(Box::new(breaker_trips.clone()))?;
        registry.register(Box::new(runs_completed.clone()))?;
        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(current_state.clone()))?;
        registry.register(Box::new(llm_latency.clone()))?;

        Ok(Self {
            registry,
            turns,
            critical_states,
            overrides,
            breaker_trips,
            runs_completed,
            tokens,
            current_state,
            llm_latency,
        })
    }

    /// 一轮分类结果；NONE 只计轮数并更新当前类别
    pub fn record_turn(&self, session_id: &str, state: CriticalState) {
        self.turns.with_label_values(&[session_id]).inc();
        self.current_state
            .with_label_values(&[session_id])
            .set(state_code(state));
        if state.is_critical() {
            self.critical_states
                .with_label_values(&[state.as_str(), session_id])
                .inc();
        }
    }

    pub fn record_override(&self, session_id: &str, action: OverrideAction) {
        self.overrides
            .with_label_values(&[action.as_str(), session_id])
            .inc();
    }

    /// reason 取 consecutive / total / oscillation
    pub fn record_trip(&self, reason: &str) {
        self.breaker_trips.with_label_values(&[reason]).inc();
    }

    pub fn record_completion(&self, outcome: &str) {
        self.runs_completed.with_label_values(&[outcome]).inc();
    }

    pub fn record_tokens(&self, session_id: &str, tokens: u64) {
        self.tokens.with_label_values(&[session_id]).inc_by(tokens);
    }

    pub fn observe_llm_latency(&self, seconds: f64) {
        self.llm_latency.observe(seconds);
    }

    pub fn trips(&self, reason: &str) -> u64 {
        self.breaker_trips.with_label_values(&[reason]).get()
    }

    pub fn completions(&self, outcome: &str) -> u64 {
        self.runs_completed.with_label_values(&[outcome]).get()
    }

    /// 从 Registry 收集某个会话的计数；未出现过的会话返回全零
    pub fn session(&self, session_id: &str) -> SessionMetrics {
        let mut snapshot = SessionMetrics::default();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let labels = metric.get_label();
                let in_session = labels
                    .iter()
                    .any(|l| l.get_name() == "session_id" && l.get_value() == session_id);
                if !in_session {
                    continue;
                }
                let value = metric.get_counter().get_value() as u64;
                let label = |name: &str| {
                    labels
                        .iter()
                        .find(|l| l.get_name() == name)
                        .map(|l| l.get_value().to_string())
                };
                match family.get_name() {
                    TURNS => snapshot.turns = value,
                    TOKENS => snapshot.tokens = value,
                    CRITICAL_STATES => {
                        if let Some(state) = label("state") {
                            snapshot.critical_states.insert(state, value);
                        }
                    }
                    OVERRIDES => {
                        if let Some(action) = label("action") {
                            snapshot.overrides.insert(action, value);
                        }
                    }
                    _ => {}
                }
            }
        }
        snapshot
    }

    /// Prometheus 文本格式
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn state_code(state: CriticalState) -> i64 {
    match state {
        CriticalState::None => 0,
        CriticalState::Deadlock => 1,
        CriticalState::Panic => 2,
        CriticalState::Hubris => 3,
        CriticalState::Scarcity => 4,
        CriticalState::Novelty => 5,
    }
}
