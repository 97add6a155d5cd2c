//! 监控层：循环检测、文本置信度、结论翻转、优先级裁决、熔断与 Silver Gauge 诊断
//!
//! 检测函数对任何合法输入都是全函数：空或过短的历史只会退化为「无信号」。

pub mod circuit_breaker;
pub mod confidence;
pub mod contradiction;
pub mod loop_detector;
pub mod monitor;
pub mod silver_gauge;

pub use circuit_breaker::{BreakerDiagnostics, CircuitBreaker, CircuitBreakerStatus, TripReason};
pub use confidence::{ConfidenceEstimator, ConfidenceMarkers};
pub use contradiction::{ContradictionDetector, Stance, StanceReading};
pub use loop_detector::{LoopDetection, LoopDetector, LoopPattern};
pub use monitor::{Contradiction, Evaluation, StateMonitor, TurnSignals};
pub use silver_gauge::{ActionKind, GaugeReading, SilverGauge};
