//! 结论翻转检测：为 NOVELTY 提供矛盾信号
//!
//! 每次回复按立场词表打分（按词匹配，前一个词是 not / no / never 时取反），
//! 与最近一次表明立场的回复方向相反时报告矛盾。没有立场词的回复不改变记录。

use serde::Serialize;

use crate::monitoring::Contradiction;

/// 支持 / 肯定结论
pub const SUPPORTING_WORDS: &[&str] = &[
    "healthy",
    "beneficial",
    "benefit",
    "benefits",
    "safe",
    "effective",
    "true",
    "correct",
    "confirmed",
];

/// 反对 / 否定结论
pub const OPPOSING_WORDS: &[&str] = &[
    "harmful",
    "harm",
    "risk",
    "risks",
    "dangerous",
    "unsafe",
    "ineffective",
    "false",
    "incorrect",
    "refuted",
];

const NEGATIONS: &[&str] = &["not", "no", "never"];

const BASE_CONFIDENCE: f64 = 0.5;
const PER_MARKER: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Supports,
    Opposes,
}

impl Stance {
    fn as_str(&self) -> &'static str {
        match self {
            Stance::Supports => "supporting",
            Stance::Opposes => "opposing",
        }
    }
}

/// 一段文本的立场与强度（净命中数）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StanceReading {
    pub stance: Stance,
    pub strength: usize,
}

/// 单次运行内的立场追踪器
#[derive(Clone, Debug, Default)]
pub struct ContradictionDetector {
    last: Option<StanceReading>,
}

impl ContradictionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 文本立场；支持与反对相互抵消，持平时无立场
    pub fn stance(text: &str) -> Option<StanceReading> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();

        let mut score: i64 = 0;
        for (i, word) in words.iter().enumerate() {
            let polarity = if SUPPORTING_WORDS.contains(word) {
                1
            } else if OPPOSING_WORDS.contains(word) {
                -1
            } else {
                continue;
            };
            let negated = i > 0 && NEGATIONS.contains(&words[i - 1]);
            score += if negated { -polarity } else { polarity };
        }

        let strength = score.unsigned_abs() as usize;
        match score {
            0 => None,
            s if s > 0 => Some(StanceReading {
                stance: Stance::Supports,
                strength,
            }),
            _ => Some(StanceReading {
                stance: Stance::Opposes,
                strength,
            }),
        }
    }

    /// 记录本轮回复；与上一个立场相反时返回矛盾
    pub fn observe(&mut self, text: &str) -> Option<Contradiction> {
        let current = Self::stance(text)?;
        let previous = self.last.replace(current)?;
        if previous.stance == current.stance {
            return None;
        }
        let confidence =
            (BASE_CONFIDENCE + PER_MARKER * (previous.strength + current.strength) as f64).min(1.0);
        Some(Contradiction::new(
            format!(
                "Conclusion flipped from {} to {} between consecutive responses",
                previous.stance.as_str(),
                current.stance.as_str()
            ),
            confidence,
        ))
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
