//! 状态定义：CriticalState 分类与单轮检测结果 StateDetection
//!
//! CriticalState 按「评估优先级」全序（不是严重程度）：SCARCITY > DEADLOCK > PANIC > HUBRIS > NOVELTY > NONE。
//! StateDetection 每轮新建，不做持久化。

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 失败类别；NONE 表示正常运行
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalState {
    None,
    /// 资源（步数 / token）即将耗尽
    Scarcity,
    /// 行动陷入重复或循环
    Deadlock,
    /// 输出中充斥犹豫措辞
    Panic,
    /// 过早地过度自信
    Hubris,
    /// 信息源相互矛盾（需外部来源追踪协作方提供）
    Novelty,
}

impl CriticalState {
    /// 所有非 NONE 类别，按评估优先级从高到低
    pub const CRITICAL: [CriticalState; 5] = [
        CriticalState::Scarcity,
        CriticalState::Deadlock,
        CriticalState::Panic,
        CriticalState::Hubris,
        CriticalState::Novelty,
    ];

    /// 评估优先级（数字越大越先评估）
    pub fn priority(&self) -> u8 {
        match self {
            CriticalState::Scarcity => 5,
            CriticalState::Deadlock => 4,
            CriticalState::Panic => 3,
            CriticalState::Hubris => 2,
            CriticalState::Novelty => 1,
            CriticalState::None => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CriticalState::None => "none",
            CriticalState::Scarcity => "scarcity",
            CriticalState::Deadlock => "deadlock",
            CriticalState::Panic => "panic",
            CriticalState::Hubris => "hubris",
            CriticalState::Novelty => "novelty",
        }
    }

    pub fn is_critical(&self) -> bool {
        !matches!(self, CriticalState::None)
    }
}

impl PartialOrd for CriticalState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CriticalState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

impl fmt::Display for CriticalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// 单轮分类结果：类别、对该分类的置信度、原因与诊断元数据
#[derive(Clone, Debug, Serialize)]
pub struct StateDetection {
    pub state: CriticalState,
    /// 对「该分类成立」的置信度，范围 [0, 1]
    pub confidence: f64,
    pub reason: String,
    pub metadata: Map<String, Value>,
}

impl StateDetection {
    pub fn new(state: CriticalState, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            state,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            metadata: Map::new(),
        }
    }

    /// 正常运行（NONE，置信度 0）
    pub fn nominal() -> Self {
        Self::new(CriticalState::None, 0.0, "Normal operation")
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// 是否命中了非 NONE 类别
    pub fn is_active(&self) -> bool {
        self.state.is_critical()
    }
}

impl fmt::Display for StateDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (confidence: {:.0}%)",
            self.state,
            self.reason,
            self.confidence * 100.0
        )
    }
}
