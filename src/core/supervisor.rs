//! 会话监管：按 session_id 保存熔断器与协议状态，串起每轮的「分类 → 熔断 → 协议」流程
//!
//! 每个会话一把 Mutex，不同会话可以在多个线程上并发评估；会话之间除账本存储外不共享任何状态。
//! 账本读取失败以 GuardError::Ledger 返回，此时该会话的熔断器与协议状态都不会被修改。
//! 每轮的分类、覆盖与跳闸都计入共享的 GuardMetrics。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;

use crate::config::{AppConfig, CircuitBreakerSection};
use crate::core::{GuardError, StateDetection};
use crate::memory::{ActionLedger, ActionRecord};
use crate::monitoring::{CircuitBreaker, CircuitBreakerStatus, StateMonitor, TurnSignals};
use crate::observability::GuardMetrics;
use crate::protocols::{ProtocolRegistry, ProtocolResponse, ProtocolState};

/// 单个会话的可变状态
#[derive(Debug)]
pub struct SessionGuard {
    pub breaker: CircuitBreaker,
    pub protocol_state: ProtocolState,
    /// 已评估的轮数
    pub turns: u32,
}

impl SessionGuard {
    fn new(config: &CircuitBreakerSection) -> Self {
        Self {
            breaker: CircuitBreaker::from_config(config),
            protocol_state: ProtocolState::default(),
            turns: 0,
        }
    }
}

/// 本轮给调用方的裁决
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", content = "response", rename_all = "snake_case")]
pub enum Verdict {
    /// 无活跃类别，按模型的选择继续
    Proceed,
    /// 必须执行（或在终止动作时解释为结束信号）的覆盖
    Override(ProtocolResponse),
    /// 熔断器已跳闸
    Halt,
}

impl Verdict {
    pub fn is_halt(&self) -> bool {
        matches!(self, Verdict::Halt)
    }
}

/// 单轮结果
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub turn: u32,
    pub detection: StateDetection,
    pub breaker: CircuitBreakerStatus,
    pub verdict: Verdict,
}

/// 多会话监管器
pub struct Supervisor {
    ledger: Arc<dyn ActionLedger>,
    monitor: StateMonitor,
    protocols: ProtocolRegistry,
    breaker_config: CircuitBreakerSection,
    metrics: Arc<GuardMetrics>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionGuard>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Supervisor {
    /// 校验配置并按配置构建各组件
    pub fn new(config: &AppConfig, ledger: Arc<dyn ActionLedger>) -> Result<Self, GuardError> {
        config.validate()?;
        Ok(Self::with_parts(
            ledger,
            StateMonitor::new(&config.monitor),
            ProtocolRegistry::from_config(&config.protocols),
            config.circuit_breaker.clone(),
            Arc::new(GuardMetrics::new()?),
        ))
    }

    pub fn with_parts(
        ledger: Arc<dyn ActionLedger>,
        monitor: StateMonitor,
        protocols: ProtocolRegistry,
        breaker_config: CircuitBreakerSection,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            ledger,
            monitor,
            protocols,
            breaker_config,
            metrics,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn ActionLedger> {
        &self.ledger
    }

    pub fn monitor(&self) -> &StateMonitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &Arc<GuardMetrics> {
        &self.metrics
    }

    /// 以随机 id 开始新会话
    pub fn new_session(&self) -> String {
        let session_id = format!("session_{}", uuid::Uuid::new_v4());
        self.begin_session(&session_id);
        session_id
    }

    /// 开始（或重新开始）一个会话；已存在的会话会被重置
    pub fn begin_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id) {
            Some(existing) => {
                let mut guard = lock(existing);
                guard.breaker.reset();
                guard.protocol_state.reset();
                guard.turns = 0;
                tracing::info!(session_id, "session restarted");
            }
            None => {
                sessions.insert(
                    session_id.to_string(),
                    Arc::new(Mutex::new(SessionGuard::new(&self.breaker_config))),
                );
                tracing::info!(session_id, "session started");
            }
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<SessionGuard>>, GuardError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| GuardError::UnknownSession(session_id.to_string()))
    }

    /// 把一次已执行的行动写入账本
    pub fn record_action(
        &self,
        session_id: &str,
        tool: &str,
        args: &str,
        result: &str,
        tokens: u64,
    ) -> Result<ActionRecord, GuardError> {
        self.session(session_id)?;
        Ok(self.ledger.record(tool, args, result, tokens, session_id)?)
    }

    /// 评估一轮：分类、记录到熔断器；未跳闸且有活跃类别时派发协议
    pub fn evaluate_turn(
        &self,
        session_id: &str,
        signals: &TurnSignals,
    ) -> Result<TurnOutcome, GuardError> {
        let session = self.session(session_id)?;
        let mut guard = lock(&session);
        let was_tripped = guard.breaker.is_tripped();

        let evaluation =
            self.monitor
                .evaluate(self.ledger.as_ref(), &mut guard.breaker, session_id, signals)?;
        guard.turns += 1;
        self.metrics.record_turn(session_id, evaluation.detection.state);

        let verdict = if evaluation.breaker.is_tripped() {
            if !was_tripped {
                if let Some(reason) = evaluation.breaker.trip_reason() {
                    self.metrics.record_trip(reason.kind());
                }
                tracing::warn!(
                    session_id,
                    reason = ?evaluation.breaker.trip_reason().map(ToString::to_string),
                    recommendations = ?evaluation.breaker.diagnostics.recommendations,
                    "session halted by circuit breaker"
                );
            }
            Verdict::Halt
        } else {
            match self
                .protocols
                .dispatch(&evaluation.detection, &mut guard.protocol_state)?
            {
                Some(response) => {
                    self.metrics.record_override(session_id, response.override_action);
                    Verdict::Override(response)
                }
                None => Verdict::Proceed,
            }
        };

        Ok(TurnOutcome {
            session_id: session_id.to_string(),
            turn: guard.turns,
            detection: evaluation.detection,
            breaker: evaluation.breaker,
            verdict,
        })
    }

    pub fn breaker_status(&self, session_id: &str) -> Result<CircuitBreakerStatus, GuardError> {
        let session = self.session(session_id)?;
        let guard = lock(&session);
        Ok(guard.breaker.status())
    }

    /// 结束会话并返回最终熔断器状态；账本中的历史保留
    pub fn end_session(&self, session_id: &str) -> Option<CircuitBreakerStatus> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)?;
        let status = lock(&removed).breaker.status();
        tracing::info!(session_id, tripped = status.tripped, "session ended");
        Some(status)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CriticalState;
    use crate::memory::InMemoryLedger;
    use crate::protocols::OverrideAction;

    fn supervisor() -> Supervisor {
        Supervisor::new(&AppConfig::default(), Arc::new(InMemoryLedger::new())).unwrap()
    }

    fn calm(step: u32) -> TurnSignals {
        TurnSignals::new("Looking into it.").step(step, 10)
    }

    #[test]
    fn test_unknown_session() {
        let sup = supervisor();
        let err = sup.evaluate_turn("ghost", &calm(1)).unwrap_err();
        assert!(matches!(err, GuardError::UnknownSession(_)));
        assert!(sup.record_action("ghost", "search", "q", "r", 1).is_err());
    }

    #[test]
    fn test_proceed_when_nominal() {
        let sup = supervisor();
        sup.begin_session("s");
        let outcome = sup.evaluate_turn("s", &calm(1)).unwrap();
        assert!(matches!(outcome.verdict, Verdict::Proceed));
        assert_eq!(outcome.turn, 1);
    }

    #[test]
    fn test_deadlock_forces_different_tool() {
        let sup = supervisor();
        sup.begin_session("s");
        for _ in 0..3 {
            sup.record_action("s", "search", "q", "r", 10).unwrap();
        }
        let first = sup.evaluate_turn("s", &calm(4)).unwrap();
        assert_eq!(first.detection.state, CriticalState::Deadlock);
        match first.verdict {
            Verdict::Override(r) => assert_eq!(r.override_action, OverrideAction::ForceDifferentTool),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_halt_after_consecutive_alerts() {
        let sup = supervisor();
        sup.begin_session("s");
        let hedging = TurnSignals::new("Maybe, possibly, perhaps? Not sure.").step(3, 10);
        sup.evaluate_turn("s", &hedging).unwrap();
        sup.evaluate_turn("s", &hedging).unwrap();
        let third = sup.evaluate_turn("s", &hedging).unwrap();
        assert!(third.verdict.is_halt());
        assert!(third.breaker.tripped);

        // 跳闸后即使输入正常也保持 Halt
        let after = sup.evaluate_turn("s", &calm(4)).unwrap();
        assert!(after.verdict.is_halt());
    }

    #[test]
    fn test_begin_session_resets_existing() {
        let sup = supervisor();
        sup.begin_session("s");
        let hedging = TurnSignals::new("Maybe, possibly, perhaps? Not sure.").step(3, 10);
        for _ in 0..3 {
            sup.evaluate_turn("s", &hedging).unwrap();
        }
        assert!(sup.breaker_status("s").unwrap().tripped);

        sup.begin_session("s");
        let status = sup.breaker_status("s").unwrap();
        assert!(!status.tripped);
        assert_eq!(status.total_alerts, 0);
    }

    #[test]
    fn test_sessions_do_not_share_state() {
        let sup = supervisor();
        sup.begin_session("a");
        sup.begin_session("b");
        for _ in 0..3 {
            sup.record_action("a", "search", "q", "r", 10).unwrap();
        }
        sup.evaluate_turn("a", &calm(4)).unwrap();
        sup.evaluate_turn("a", &calm(5)).unwrap();

        let b = sup.evaluate_turn("b", &calm(1)).unwrap();
        assert!(matches!(b.verdict, Verdict::Proceed));
        assert_eq!(sup.breaker_status("b").unwrap().total_alerts, 0);
        assert_eq!(sup.breaker_status("a").unwrap().total_alerts, 2);
    }

    #[test]
    fn test_end_session() {
        let sup = supervisor();
        let id = sup.new_session();
        assert_eq!(sup.active_sessions(), vec![id.clone()]);
        assert!(sup.end_session(&id).is_some());
        assert!(sup.active_sessions().is_empty());
        assert!(sup.end_session(&id).is_none());
    }

    #[test]
    fn test_metrics_follow_turns() {
        let sup = supervisor();
        sup.begin_session("s");
        for _ in 0..3 {
            sup.record_action("s", "search", "q", "r", 10).unwrap();
        }
        sup.evaluate_turn("s", &calm(4)).unwrap();
        sup.evaluate_turn("s", &calm(5)).unwrap();
        sup.evaluate_turn("s", &calm(6)).unwrap();

        let m = sup.metrics().session("s");
        assert_eq!(m.turns, 3);
        assert_eq!(m.critical_states.get("deadlock"), Some(&3));
        // 第三次 DEADLOCK 让熔断器跳闸，不再派发协议
        assert_eq!(m.overrides.get("force_different_tool"), Some(&2));
        assert_eq!(sup.metrics().trips("consecutive"), 1);

        // 跳闸后继续评估不重复计数
        sup.evaluate_turn("s", &calm(7)).unwrap();
        assert_eq!(sup.metrics().trips("consecutive"), 1);
    }

    #[test]
    fn test_concurrent_sessions() {
        let sup = Arc::new(supervisor());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sup = Arc::clone(&sup);
                std::thread::spawn(move || {
                    let id = format!("t{i}");
                    sup.begin_session(&id);
                    for step in 1..=3 {
                        sup.record_action(&id, "search", &format!("q{step}"), "r", 5).unwrap();
                        sup.evaluate_turn(&id, &calm(step + 2)).unwrap();
                    }
                    sup.breaker_status(&id).unwrap().total_alerts
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 0);
        }
        assert_eq!(sup.active_sessions().len(), 4);
    }
}
