//! Silver Gauge：用目标价值 G 与信息增益 I 的几何关系描述一次行动
//!
//! k = 调和平均(G, I) / 算术平均(G, I)；k 接近 1 表示两者均衡（Generalist），k 偏小表示偏科（Specialist）。

use serde::Serialize;

/// k 不低于该值视为均衡
pub const GENERALIST_THRESHOLD: f64 = 0.8;

const MIN_INPUT: f64 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Generalist,
    Specialist,
}

#[derive(Clone, Debug, Serialize)]
pub struct GaugeReading {
    pub goal_value: f64,
    pub info_gain: f64,
    pub harmonic_mean: f64,
    pub arithmetic_mean: f64,
    pub k_explore: f64,
    pub kind: ActionKind,
    pub description: &'static str,
}

pub struct SilverGauge;

impl SilverGauge {
    /// 输入先截断到 [0.001, 1]，因此分母不会为 0
    pub fn calculate(goal_value: f64, info_gain: f64) -> GaugeReading {
        let g = goal_value.clamp(MIN_INPUT, 1.0);
        let i = info_gain.clamp(MIN_INPUT, 1.0);

        let am = (g + i) / 2.0;
        let hm = 2.0 * g * i / (g + i);
        let k = hm / am;

        let (kind, description) = if k >= GENERALIST_THRESHOLD {
            (ActionKind::Generalist, "Balanced action (Generalist)")
        } else if g > i {
            (ActionKind::Specialist, "Goal-focused action (Specialist)")
        } else {
            (ActionKind::Specialist, "Exploration-focused action (Specialist)")
        };

        GaugeReading {
            goal_value: g,
            info_gain: i,
            harmonic_mean: hm,
            arithmetic_mean: am,
            k_explore: k,
            kind,
            description,
        }
    }
}
