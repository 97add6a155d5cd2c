//! 控制循环事件：可序列化为 JSON，供日志或前端展示

use serde::Serialize;

use crate::core::CriticalState;
use crate::monitoring::GaugeReading;
use crate::protocols::OverrideAction;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardEvent {
    /// 当前第几步
    StepUpdate { step: u32, max_steps: u32 },
    /// 本轮分类结果
    Classified {
        step: u32,
        state: CriticalState,
        confidence: f64,
        reason: String,
    },
    /// 协议覆盖了模型的选择
    Override {
        step: u32,
        action: OverrideAction,
        reasoning: String,
    },
    /// 执行工具（附 Silver Gauge 读数）
    ToolCall {
        step: u32,
        tool: String,
        args: serde_json::Value,
        gauge: GaugeReading,
    },
    /// 没有对应工具的协议动作（不经执行器）
    ProtocolAction {
        step: u32,
        action: OverrideAction,
        args: serde_json::Value,
    },
    /// 工具或协议动作的结果（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 工具执行失败；失败结果同样写入账本
    ToolFailure { tool: String, reason: String },
    /// 单轮可恢复错误（如账本暂不可用），循环进入下一步
    TurnError { step: u32, error: String },
    /// 熔断器跳闸
    Halted {
        step: u32,
        reason: String,
        recommendations: Vec<String>,
    },
    /// 最终答案
    Answer { text: String },
    Error { text: String },
}
