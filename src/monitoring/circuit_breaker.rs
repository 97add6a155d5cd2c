//! 熔断器：按会话统计连续 / 累计告警，检测类别间振荡；一旦跳闸便保持跳闸
//!
//! - record(NONE)：连续计数清零，不影响累计计数与历史
//! - record(非 NONE)：追加历史，连续与累计各 +1，依次检查 consecutive → total → oscillation
//! - 跳闸后任何 record 都原样返回当前状态，只有 reset()（新会话）能清除

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::config::CircuitBreakerSection;
use crate::core::CriticalState;

/// 历史环形缓冲长度（仅用于展示与振荡检测）
const HISTORY_CAPACITY: usize = 10;
/// 诊断中展示的最近类别数
const LAST_STATES: usize = 5;
/// 振荡检测回看的告警条数
const OSCILLATION_LOOKBACK: usize = 6;

/// 跳闸原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    Consecutive { count: usize },
    Total { count: usize },
    Oscillation { a: CriticalState, b: CriticalState },
}

impl TripReason {
    /// 指标标签用的简短名称
    pub fn kind(&self) -> &'static str {
        match self {
            TripReason::Consecutive { .. } => "consecutive",
            TripReason::Total { .. } => "total",
            TripReason::Oscillation { .. } => "oscillation",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::Consecutive { count } => write!(f, "consecutive critical states: {count}"),
            TripReason::Total { count } => write!(f, "total critical states exceeded: {count}"),
            TripReason::Oscillation { a, b } => {
                write!(f, "oscillation detected between {a} and {b}")
            }
        }
    }
}

/// 跳闸时的诊断信息
#[derive(Clone, Debug, Default, Serialize)]
pub struct BreakerDiagnostics {
    pub trip_reason: Option<TripReason>,
    /// 所有记录过的类别出现次数
    pub state_frequency: BTreeMap<CriticalState, usize>,
    pub last_states: Vec<CriticalState>,
    pub recommendations: Vec<String>,
}

/// 每次 record 返回的状态快照
#[derive(Clone, Debug, Serialize)]
pub struct CircuitBreakerStatus {
    pub tripped: bool,
    pub consecutive_alerts: usize,
    pub total_alerts: usize,
    /// 最近至多 10 条告警（最旧在前）
    pub alert_history: Vec<CriticalState>,
    pub thrashing_pattern: Option<String>,
    pub diagnostics: BreakerDiagnostics,
}

impl CircuitBreakerStatus {
    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn trip_reason(&self) -> Option<&TripReason> {
        self.diagnostics.trip_reason.as_ref()
    }
}

/// 单会话熔断器
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    max_consecutive: usize,
    max_total: usize,
    consecutive_count: usize,
    total_count: usize,
    history: VecDeque<CriticalState>,
    frequency: HashMap<CriticalState, usize>,
    trip_reason: Option<TripReason>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 10)
    }
}

impl CircuitBreaker {
    pub fn new(max_consecutive: usize, max_total: usize) -> Self {
        Self {
            max_consecutive,
            max_total,
            consecutive_count: 0,
            total_count: 0,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            frequency: HashMap::new(),
            trip_reason: None,
        }
    }

    pub fn from_config(config: &CircuitBreakerSection) -> Self {
        Self::new(config.max_consecutive, config.max_total)
    }

    pub fn is_tripped(&self) -> bool {
        self.trip_reason.is_some()
    }

    pub fn consecutive_count(&self) -> usize {
        self.consecutive_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// 记录一轮分类结果
    pub fn record(&mut self, state: CriticalState) -> CircuitBreakerStatus {
        if self.is_tripped() {
            return self.status();
        }

        if !state.is_critical() {
            self.consecutive_count = 0;
            return self.status();
        }

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(state);
        *self.frequency.entry(state).or_insert(0) += 1;
        self.consecutive_count += 1;
        self.total_count += 1;

        let reason = if self.consecutive_count >= self.max_consecutive {
            Some(TripReason::Consecutive {
                count: self.consecutive_count,
            })
        } else if self.total_count >= self.max_total {
            Some(TripReason::Total {
                count: self.total_count,
            })
        } else {
            self.oscillation()
                .map(|(a, b)| TripReason::Oscillation { a, b })
        };

        if let Some(reason) = reason {
            tracing::warn!(
                reason = %reason,
                consecutive = self.consecutive_count,
                total = self.total_count,
                "circuit breaker tripped"
            );
            self.trip_reason = Some(reason);
        }

        self.status()
    }

    /// 新会话开始时清空全部状态；不得用于跳闸后的会话内恢复
    pub fn reset(&mut self) {
        self.consecutive_count = 0;
        self.total_count = 0;
        self.history.clear();
        self.frequency.clear();
        self.trip_reason = None;
    }

    /// 最近告警中的 A-B-A-B 模式
    fn oscillation(&self) -> Option<(CriticalState, CriticalState)> {
        let recent: Vec<CriticalState> = self
            .history
            .iter()
            .rev()
            .take(OSCILLATION_LOOKBACK)
            .rev()
            .copied()
            .filter(CriticalState::is_critical)
            .collect();
        let n = recent.len();
        if n < 4 {
            return None;
        }
        let (a, b, c, d) = (recent[n - 4], recent[n - 3], recent[n - 2], recent[n - 1]);
        (a == c && b == d && a != b).then_some((a, b))
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            tripped: self.is_tripped(),
            consecutive_alerts: self.consecutive_count,
            total_alerts: self.total_count,
            alert_history: self.history.iter().copied().collect(),
            thrashing_pattern: self.thrashing_pattern(),
            diagnostics: BreakerDiagnostics {
                trip_reason: self.trip_reason.clone(),
                state_frequency: self.frequency.iter().map(|(s, c)| (*s, *c)).collect(),
                last_states: self
                    .history
                    .iter()
                    .skip(self.history.len().saturating_sub(LAST_STATES))
                    .copied()
                    .collect(),
                recommendations: self.recommendations(),
            },
        }
    }

    /// 出现次数排序：次数降序，同次数按评估优先级降序
    fn ranked(&self) -> Vec<(CriticalState, usize)> {
        let mut ranked: Vec<_> = self.frequency.iter().map(|(s, c)| (*s, *c)).collect();
        ranked.sort_by(|(sa, ca), (sb, cb)| cb.cmp(ca).then(sb.cmp(sa)));
        ranked
    }

    fn thrashing_pattern(&self) -> Option<String> {
        let ranked = self.ranked();
        match ranked.as_slice() {
            [] => None,
            [(state, count)] => Some(format!("Repeated {state} ({count} times)")),
            [(s1, c1), (s2, c2), ..] if c1 == c2 => {
                Some(format!("Oscillating between {s1} and {s2}"))
            }
            [(s1, c1), (s2, c2), ..] => {
                Some(format!("Primarily {s1} ({c1}x) with some {s2} ({c2}x)"))
            }
        }
    }

    fn count_of(&self, state: CriticalState) -> usize {
        self.frequency.get(&state).copied().unwrap_or(0)
    }

    fn recommendations(&self) -> Vec<String> {
        if !self.is_tripped() {
            return Vec::new();
        }

        let mut recs = Vec::new();
        if self.count_of(CriticalState::Deadlock) >= 3 {
            recs.push("High DEADLOCK count: diversify the available tools/actions".to_string());
        }
        if self.count_of(CriticalState::Panic) >= 3 {
            recs.push("High PANIC count: clarify the goal; the query may be vague or contradictory".to_string());
        }
        if self.count_of(CriticalState::Hubris) >= 2 {
            recs.push("Multiple HUBRIS triggers: lower the confidence threshold".to_string());
        }
        if self.count_of(CriticalState::Scarcity) >= 2 {
            recs.push("Multiple SCARCITY triggers: raise the token/step budget".to_string());
        }
        if matches!(self.trip_reason, Some(TripReason::Oscillation { .. })) {
            recs.push("Oscillation detected: protocols may have conflicting priorities".to_string());
        }
        if recs.is_empty() {
            recs.push("General thrashing: simplify the query or add more context".to_string());
        }
        recs
    }
}

impl fmt::Display for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trip_reason {
            Some(reason) => write!(f, "CIRCUIT BREAKER TRIPPED: {reason}"),
            None => write!(
                f,
                "Circuit Breaker: {}/{} consecutive, {}/{} total",
                self.consecutive_count, self.max_consecutive, self.total_count, self.max_total
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CriticalState::*;

    #[test]
    fn test_initial_state() {
        let breaker = CircuitBreaker::default();
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.consecutive_count(), 0);
        assert_eq!(breaker.total_count(), 0);
    }

    #[test]
    fn test_single_alert_does_not_trip() {
        let mut breaker = CircuitBreaker::default();
        let status = breaker.record(Panic);
        assert!(!status.is_tripped());
        assert_eq!(status.consecutive_alerts, 1);
        assert_eq!(status.total_alerts, 1);
        assert!(status.diagnostics.recommendations.is_empty());
    }

    #[test]
    fn test_consecutive_trip() {
        let mut breaker = CircuitBreaker::new(3, 10);
        assert!(!breaker.record(Deadlock).is_tripped());
        assert!(!breaker.record(Deadlock).is_tripped());
        let status = breaker.record(Deadlock);
        assert!(status.is_tripped());
        assert!(status.trip_reason().unwrap().to_string().contains("consecutive"));
        assert!(status
            .diagnostics
            .recommendations
            .iter()
            .any(|r| r.contains("DEADLOCK")));
    }

    #[test]
    fn test_none_resets_consecutive_only() {
        let mut breaker = CircuitBreaker::default();
        breaker.record(Panic);
        breaker.record(Panic);
        let status = breaker.record(None);
        assert_eq!(status.consecutive_alerts, 0);
        assert_eq!(status.total_alerts, 2);
        assert_eq!(status.alert_history, vec![Panic, Panic]);
        assert!(!status.is_tripped());
    }

    #[test]
    fn test_total_trip() {
        let mut breaker = CircuitBreaker::new(3, 10);
        let rotation = [Panic, Deadlock, Hubris];
        let mut last = breaker.status();
        for i in 0..10 {
            last = breaker.record(rotation[i % 3]);
            if last.is_tripped() {
                break;
            }
            breaker.record(None);
        }
        assert!(last.is_tripped());
        assert_eq!(last.total_alerts, 10);
        assert!(matches!(last.trip_reason(), Some(TripReason::Total { count: 10 })));
    }

    #[test]
    fn test_oscillation_trip_below_limits() {
        let mut breaker = CircuitBreaker::new(3, 10);
        breaker.record(Panic);
        breaker.record(None);
        breaker.record(Deadlock);
        breaker.record(None);
        breaker.record(Panic);
        breaker.record(None);
        let status = breaker.record(Deadlock);
        assert!(status.is_tripped());
        assert!(status.consecutive_alerts < 3);
        assert!(status.total_alerts < 10);
        assert_eq!(
            status.trip_reason(),
            Some(&TripReason::Oscillation { a: Panic, b: Deadlock })
        );
        assert!(status
            .diagnostics
            .recommendations
            .iter()
            .any(|r| r.contains("Oscillation")));
    }

    #[test]
    fn test_stays_tripped() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.record(Panic);
        }
        assert!(breaker.is_tripped());
        let before = breaker.total_count();
        for state in [None, None, Hubris, Scarcity, None] {
            let status = breaker.record(state);
            assert!(status.is_tripped());
        }
        assert_eq!(breaker.total_count(), before);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.record(Deadlock);
        }
        breaker.reset();
        let status = breaker.status();
        assert!(!status.is_tripped());
        assert_eq!(status.total_alerts, 0);
        assert!(status.alert_history.is_empty());
        assert!(status.diagnostics.state_frequency.is_empty());
    }

    #[test]
    fn test_history_is_bounded_but_counts_are_not() {
        let mut breaker = CircuitBreaker::new(100, 100);
        let rotation = [Panic, Deadlock, Hubris];
        for i in 0..15 {
            breaker.record(rotation[i % 3]);
        }
        let status = breaker.status();
        assert_eq!(status.alert_history.len(), 10);
        assert_eq!(status.total_alerts, 15);
        assert_eq!(status.diagnostics.state_frequency.values().sum::<usize>(), 15);
    }

    #[test]
    fn test_diagnostics_after_trip() {
        let mut breaker = CircuitBreaker::new(3, 10);
        breaker.record(Scarcity);
        breaker.record(None);
        breaker.record(Hubris);
        breaker.record(Scarcity);
        let status = breaker.record(Hubris);
        // H, S, H 连续三次先于振荡检查触发
        assert!(status.is_tripped());
        assert!(matches!(status.trip_reason(), Some(TripReason::Consecutive { count: 3 })));
        let d = &status.diagnostics;
        assert_eq!(d.state_frequency.get(&Scarcity), Some(&2));
        assert_eq!(d.last_states, vec![Scarcity, Hubris, Scarcity, Hubris]);
        assert!(d.recommendations.iter().any(|r| r.contains("SCARCITY")));
        assert!(d.recommendations.iter().any(|r| r.contains("HUBRIS")));
    }

    #[test]
    fn test_general_recommendation_when_nothing_dominates() {
        let mut breaker = CircuitBreaker::new(3, 10);
        breaker.record(Panic);
        breaker.record(Deadlock);
        let status = breaker.record(Novelty);
        assert!(status.is_tripped());
        assert_eq!(status.diagnostics.recommendations.len(), 1);
        assert!(status.diagnostics.recommendations[0].contains("General"));
    }

    #[test]
    fn test_thrashing_pattern() {
        let mut breaker = CircuitBreaker::new(10, 10);
        assert!(breaker.status().thrashing_pattern.is_none());
        breaker.record(Panic);
        assert_eq!(
            breaker.status().thrashing_pattern.as_deref(),
            Some("Repeated PANIC (1 times)")
        );
        breaker.record(Deadlock);
        assert_eq!(
            breaker.status().thrashing_pattern.as_deref(),
            Some("Oscillating between DEADLOCK and PANIC")
        );
    }
}
