//! 循环检测：对最近若干条签名（最新在前）识别精确重复与 2/3 周期振荡
//!
//! 检查顺序固定：精确重复 > 2-周期 > 3-周期。同时满足重复与周期条件时必须报告精确重复。
//! 历史条数少于阈值（或为空）时一律不报告，不会出错。
//!
//! 工具相同但参数签名不同的两条记录永远不算循环，即使语义上冗余。

use std::fmt;

use serde::Serialize;

use crate::memory::Signature;

/// 默认检测窗口
pub const DEFAULT_WINDOW: usize = 5;
/// 默认最少重复次数
pub const DEFAULT_THRESHOLD: usize = 3;

/// 2-周期最多向后确认的条目数
const TWO_CYCLE_SCAN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPattern {
    /// A → A → A
    ExactRepeat,
    /// A → B → A → B 或 A → B → C → A → B → C
    Cycle,
}

impl fmt::Display for LoopPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopPattern::ExactRepeat => write!(f, "EXACT_REPEAT"),
            LoopPattern::Cycle => write!(f, "CYCLE"),
        }
    }
}

/// 检测结果
#[derive(Clone, Debug, Serialize)]
pub struct LoopDetection {
    pub pattern: LoopPattern,
    pub confidence: f64,
    pub description: String,
    /// 构成循环的签名（最新在前）
    pub sequence: Vec<Signature>,
    /// 精确重复时：被重复的签名
    pub repeated: Option<Signature>,
    /// 精确重复：连续长度；周期：确认的完整周期数
    pub repetitions: usize,
    /// 周期长度（精确重复为 1）
    pub period: usize,
}

/// 纯函数式检测器，只持有窗口与阈值
#[derive(Clone, Debug)]
pub struct LoopDetector {
    window: usize,
    threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl LoopDetector {
    /// threshold 低于 2 时按 2 处理（单条记录不构成重复）
    pub fn new(window: usize, threshold: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(2),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// 对最新在前的签名列表做检测；只看前 window 条
    pub fn detect(&self, signatures: &[Signature]) -> Option<LoopDetection> {
        let sigs = &signatures[..signatures.len().min(self.window)];
        if sigs.len() < self.threshold {
            return None;
        }
        self.exact_repeat(sigs)
            .or_else(|| two_cycle(sigs))
            .or_else(|| three_cycle(sigs))
    }

    fn exact_repeat(&self, sigs: &[Signature]) -> Option<LoopDetection> {
        let first = sigs.first()?;
        let run = sigs.iter().take_while(|s| *s == first).count();
        if run < self.threshold {
            return None;
        }
        Some(LoopDetection {
            pattern: LoopPattern::ExactRepeat,
            confidence: 1.0,
            description: format!("Exact repetition: {first} x {run}"),
            sequence: sigs[..run].to_vec(),
            repeated: Some(first.clone()),
            repetitions: run,
            period: 1,
        })
    }
}

fn two_cycle(sigs: &[Signature]) -> Option<LoopDetection> {
    if sigs.len() < 4 {
        return None;
    }
    if !(sigs[0] == sigs[2] && sigs[1] == sigs[3] && sigs[0] != sigs[1]) {
        return None;
    }

    let limit = (sigs.len() - 1).min(TWO_CYCLE_SCAN);
    let cycles = (0..limit)
        .step_by(2)
        .take_while(|&i| sigs[i] == sigs[0] && sigs[i + 1] == sigs[1])
        .count();
    if cycles < 2 {
        return None;
    }

    Some(LoopDetection {
        pattern: LoopPattern::Cycle,
        confidence: 0.9,
        description: format!(
            "2-cycle: {} <-> {} ({} cycles)",
            sigs[0].tool, sigs[1].tool, cycles
        ),
        sequence: sigs[..cycles * 2].to_vec(),
        repeated: None,
        repetitions: cycles,
        period: 2,
    })
}

fn three_cycle(sigs: &[Signature]) -> Option<LoopDetection> {
    if sigs.len() < 6 || sigs[0..3] != sigs[3..6] {
        return None;
    }
    if sigs[0] == sigs[1] && sigs[1] == sigs[2] {
        return None;
    }
    Some(LoopDetection {
        pattern: LoopPattern::Cycle,
        confidence: 0.85,
        description: format!(
            "3-cycle: {} -> {} -> {}",
            sigs[0].tool, sigs[1].tool, sigs[2].tool
        ),
        sequence: sigs[..6].to_vec(),
        repeated: None,
        repetitions: 2,
        period: 3,
    })
}
