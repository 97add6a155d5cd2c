//! StateMonitor：每轮把资源比率、循环检测与文本置信度合成一个按优先级裁决的分类
//!
//! 固定顺序，先命中者胜出：SCARCITY → DEADLOCK → PANIC → HUBRIS → NOVELTY → NONE。
//! evaluate() 无条件把结果（包括 NONE）交给熔断器记录。

use serde::Serialize;
use serde_json::json;

use crate::config::MonitorSection;
use crate::core::{CriticalState, GuardError, StateDetection};
use crate::memory::{ActionLedger, Signature};
use crate::monitoring::{CircuitBreaker, CircuitBreakerStatus, ConfidenceEstimator, LoopDetector};

/// 矛盾信号（通常来自 ContradictionDetector）；没有它 NOVELTY 永不触发
#[derive(Clone, Debug, Serialize)]
pub struct Contradiction {
    pub description: String,
    pub confidence: f64,
}

impl Contradiction {
    pub fn new(description: impl Into<String>, confidence: f64) -> Self {
        Self {
            description: description.into(),
            confidence,
        }
    }
}

/// 调用方每轮提供的输入
#[derive(Clone, Debug, Default, Serialize)]
pub struct TurnSignals {
    /// 模型本轮输出的自由文本
    pub text: String,
    pub current_step: u32,
    pub max_steps: u32,
    pub tokens_used: u64,
    pub token_budget: u64,
    pub contradiction: Option<Contradiction>,
}

impl TurnSignals {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn step(mut self, current: u32, max: u32) -> Self {
        self.current_step = current;
        self.max_steps = max;
        self
    }

    pub fn tokens(mut self, used: u64, budget: u64) -> Self {
        self.tokens_used = used;
        self.token_budget = budget;
        self
    }

    pub fn contradiction(mut self, contradiction: Contradiction) -> Self {
        self.contradiction = Some(contradiction);
        self
    }
}

/// 一轮评估的结果：分类 + 记录后的熔断器状态
#[derive(Clone, Debug, Serialize)]
pub struct Evaluation {
    pub detection: StateDetection,
    pub breaker: CircuitBreakerStatus,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// 优先级裁决器，本身无每会话状态
#[derive(Clone, Debug)]
pub struct StateMonitor {
    scarcity_threshold: f64,
    panic_threshold: f64,
    hubris_threshold: f64,
    hubris_max_steps: u32,
    detector: LoopDetector,
}

impl Default for StateMonitor {
    fn default() -> Self {
        Self::new(&MonitorSection::default())
    }
}

impl StateMonitor {
    pub fn new(config: &MonitorSection) -> Self {
        Self {
            scarcity_threshold: config.scarcity_threshold,
            panic_threshold: config.panic_threshold,
            hubris_threshold: config.hubris_threshold,
            hubris_max_steps: config.hubris_max_steps,
            detector: LoopDetector::new(config.deadlock_window, config.loop_threshold),
        }
    }

    pub fn detector(&self) -> &LoopDetector {
        &self.detector
    }

    /// 读取该会话最近的签名，分类，然后记录到熔断器
    ///
    /// 账本读取失败时直接返回错误，熔断器不被修改。
    pub fn evaluate(
        &self,
        ledger: &dyn ActionLedger,
        breaker: &mut CircuitBreaker,
        session_id: &str,
        signals: &TurnSignals,
    ) -> Result<Evaluation, GuardError> {
        let recent = ledger.recent_signatures(session_id, self.detector.window())?;
        let detection = self.classify(&recent, signals);
        tracing::debug!(
            session_id,
            state = %detection.state,
            confidence = detection.confidence,
            reason = %detection.reason,
            "turn classified"
        );
        let breaker = breaker.record(detection.state);
        Ok(Evaluation { detection, breaker })
    }

    /// 纯分类：recent 为最新在前的签名
    pub fn classify(&self, recent: &[Signature], signals: &TurnSignals) -> StateDetection {
        if let Some(d) = self.check_scarcity(signals) {
            return d;
        }

        if let Some(found) = self.detector.detect(recent) {
            let sequence: Vec<String> = found.sequence.iter().map(ToString::to_string).collect();
            return StateDetection::new(
                CriticalState::Deadlock,
                found.confidence,
                format!("DEADLOCK: {}", found.description),
            )
            .with_meta("pattern", found.pattern.to_string())
            .with_meta("sequence", sequence)
            .with_meta("repetitions", found.repetitions)
            .with_meta("period", found.period);
        }

        let text_confidence = ConfidenceEstimator::estimate(&signals.text);

        if text_confidence < self.panic_threshold {
            return StateDetection::new(
                CriticalState::Panic,
                1.0 - text_confidence,
                format!(
                    "PANIC: Low confidence detected ({:.0}%)",
                    text_confidence * 100.0
                ),
            )
            .with_meta("text_confidence", text_confidence);
        }

        if text_confidence > self.hubris_threshold && signals.current_step <= self.hubris_max_steps
        {
            return StateDetection::new(
                CriticalState::Hubris,
                text_confidence,
                format!(
                    "HUBRIS: High confidence ({:.0}%) too early (step {})",
                    text_confidence * 100.0,
                    signals.current_step
                ),
            )
            .with_meta("steps_taken", signals.current_step)
            .with_meta("text_confidence", text_confidence);
        }

        if let Some(c) = &signals.contradiction {
            return StateDetection::new(
                CriticalState::Novelty,
                c.confidence,
                format!("NOVELTY: {}", c.description),
            )
            .with_meta("contradiction", c.description.clone());
        }

        StateDetection::nominal()
    }

    fn check_scarcity(&self, signals: &TurnSignals) -> Option<StateDetection> {
        let step_ratio = ratio(signals.current_step as f64, signals.max_steps as f64);
        let token_ratio = ratio(signals.tokens_used as f64, signals.token_budget as f64);

        let mut reasons = Vec::new();
        let mut triggered_by = Vec::new();
        if step_ratio > self.scarcity_threshold {
            reasons.push(format!("Steps exhausted ({:.0}%)", step_ratio * 100.0));
            triggered_by.push("steps");
        }
        if token_ratio > self.scarcity_threshold {
            reasons.push(format!("Tokens exhausted ({:.0}%)", token_ratio * 100.0));
            triggered_by.push("tokens");
        }
        if triggered_by.is_empty() {
            return None;
        }

        Some(
            StateDetection::new(
                CriticalState::Scarcity,
                1.0,
                format!("SCARCITY: {}", reasons.join(", ")),
            )
            .with_meta("step_ratio", step_ratio)
            .with_meta("token_ratio", token_ratio)
            .with_meta("triggered_by", json!(triggered_by)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LedgerError;
    use crate::memory::{ActionRecord, InMemoryLedger};

    fn sigs(tools: &[&str]) -> Vec<Signature> {
        tools.iter().map(|t| Signature::new(*t, "q")).collect()
    }

    const CONFIDENT: &str = "This is definitely, certainly, absolutely the answer.";
    const HEDGING: &str = "Maybe, possibly, perhaps it could be this? I'm not sure.";

    #[test]
    fn test_nominal() {
        let m = StateMonitor::default();
        let d = m.classify(&[], &TurnSignals::new("Paris is the capital.").step(5, 10));
        assert_eq!(d.state, CriticalState::None);
        assert_eq!(d.confidence, 0.0);
        assert!(!d.is_active());
    }

    #[test]
    fn test_scarcity_beats_hubris() {
        let m = StateMonitor::default();
        // 早期 + 极度自信 同时 步数已满
        let signals = TurnSignals::new(CONFIDENT).step(2, 2);
        let d = m.classify(&[], &signals);
        assert_eq!(d.state, CriticalState::Scarcity);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.metadata["triggered_by"], json!(["steps"]));
    }

    #[test]
    fn test_scarcity_on_tokens() {
        let m = StateMonitor::default();
        let d = m.classify(&[], &TurnSignals::new("ok").step(1, 10).tokens(950, 1000));
        assert_eq!(d.state, CriticalState::Scarcity);
        assert_eq!(d.metadata["token_ratio"], json!(0.95));
    }

    #[test]
    fn test_zero_denominators_never_scarce() {
        let m = StateMonitor::default();
        let d = m.classify(&[], &TurnSignals::new("ok").step(50, 0).tokens(5000, 0));
        assert_ne!(d.state, CriticalState::Scarcity);
    }

    #[test]
    fn test_scarcity_threshold_is_strict() {
        let m = StateMonitor::default();
        let d = m.classify(&[], &TurnSignals::new("ok").step(9, 10));
        assert_eq!(d.state, CriticalState::None);
    }

    #[test]
    fn test_deadlock_beats_panic() {
        let m = StateMonitor::default();
        let d = m.classify(&sigs(&["search", "search", "search"]), &TurnSignals::new(HEDGING).step(3, 10));
        assert_eq!(d.state, CriticalState::Deadlock);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.metadata["pattern"], json!("EXACT_REPEAT"));
    }

    #[test]
    fn test_panic_confidence_is_inverse_of_text() {
        let m = StateMonitor::default();
        let d = m.classify(&[], &TurnSignals::new(HEDGING).step(3, 10));
        assert_eq!(d.state, CriticalState::Panic);
        let text = d.metadata["text_confidence"].as_f64().unwrap();
        assert!((d.confidence - (1.0 - text)).abs() < 1e-9);
    }

    #[test]
    fn test_hubris_only_early() {
        let m = StateMonitor::default();
        let early = m.classify(&[], &TurnSignals::new(CONFIDENT).step(1, 10));
        assert_eq!(early.state, CriticalState::Hubris);
        let late = m.classify(&[], &TurnSignals::new(CONFIDENT).step(3, 10));
        assert_eq!(late.state, CriticalState::None);
    }

    #[test]
    fn test_novelty_requires_contradiction() {
        let m = StateMonitor::default();
        let signals = TurnSignals::new("ok")
            .step(4, 10)
            .contradiction(Contradiction::new("sources disagree on date", 0.7));
        let d = m.classify(&[], &signals);
        assert_eq!(d.state, CriticalState::Novelty);
        assert_eq!(d.confidence, 0.7);
    }

    #[test]
    fn test_evaluate_records_none_to_breaker() {
        let m = StateMonitor::default();
        let ledger = InMemoryLedger::new();
        let mut breaker = CircuitBreaker::default();
        breaker.record(CriticalState::Panic);
        breaker.record(CriticalState::Panic);
        let eval = m
            .evaluate(&ledger, &mut breaker, "s", &TurnSignals::new("fine").step(3, 10))
            .unwrap();
        assert_eq!(eval.detection.state, CriticalState::None);
        assert_eq!(eval.breaker.consecutive_alerts, 0);
        assert_eq!(eval.breaker.total_alerts, 2);
    }

    #[test]
    fn test_evaluate_reads_session_history() {
        let m = StateMonitor::default();
        let ledger = InMemoryLedger::new();
        for _ in 0..3 {
            ledger.record("search", "q", "r", 10, "loop").unwrap();
        }
        ledger.record("search", "q", "r", 10, "other").unwrap();
        let mut breaker = CircuitBreaker::default();

        let eval = m
            .evaluate(&ledger, &mut breaker, "loop", &TurnSignals::new("ok").step(3, 10))
            .unwrap();
        assert_eq!(eval.detection.state, CriticalState::Deadlock);

        let mut other = CircuitBreaker::default();
        let eval = m
            .evaluate(&ledger, &mut other, "other", &TurnSignals::new("ok").step(1, 10))
            .unwrap();
        assert_eq!(eval.detection.state, CriticalState::None);
    }

    struct BrokenLedger;

    impl ActionLedger for BrokenLedger {
        fn record(&self, _: &str, _: &str, _: &str, _: u64, _: &str) -> Result<ActionRecord, LedgerError> {
            Err(LedgerError::Poisoned)
        }
        fn recent(&self, _: &str, _: usize) -> Result<Vec<ActionRecord>, LedgerError> {
            Err(LedgerError::Poisoned)
        }
        fn token_usage(&self, _: &str) -> Result<u64, LedgerError> {
            Err(LedgerError::Poisoned)
        }
        fn action_count(&self, _: &str) -> Result<usize, LedgerError> {
            Err(LedgerError::Poisoned)
        }
    }

    #[test]
    fn test_ledger_failure_leaves_breaker_untouched() {
        let m = StateMonitor::default();
        let mut breaker = CircuitBreaker::default();
        breaker.record(CriticalState::Deadlock);
        let err = m
            .evaluate(&BrokenLedger, &mut breaker, "s", &TurnSignals::new("x").step(1, 10))
            .unwrap_err();
        assert!(matches!(err, GuardError::Ledger(_)));
        assert_eq!(breaker.total_count(), 1);
        assert_eq!(breaker.consecutive_count(), 1);
    }
}
