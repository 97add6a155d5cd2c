//! 覆盖协议：每个非 NONE 类别对应一个确定性的覆盖动作

pub mod registry;

pub use registry::{OverrideAction, ProtocolHandler, ProtocolRegistry, ProtocolResponse, ProtocolState};
