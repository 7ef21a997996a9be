// gbdevice: GB28181 设备端协议核心库
//
// 架构：
// - sip/: SIP 信令层（传输、编解码、认证、SDP、会话、引擎）
// - manscdp/: MANSCDP 控制协议（XML 解析、命令分发）
// - device/: 设备本地能力（设备信息、云台、告警、录像、配置）

pub mod error;
pub mod sip;
pub mod manscdp;
pub mod device;

// 重新导出常用类型
pub use error::{DeviceError, Result};
