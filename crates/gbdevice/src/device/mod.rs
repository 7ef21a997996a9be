// 设备本地能力
// 协议核心通过能力接口访问设备信息、云台、告警、录像与配置

pub mod info;
pub mod ptz;
pub mod alarm;
pub mod record;
pub mod config;

pub use info::{ChannelInfo, DeviceInfo, DeviceInfoProvider, ChannelProvider, DeviceStatus, StaticDevice};
pub use ptz::{HardwarePtzSink, PtzAction, PtzCommand, PtzController, PtzDirection};
pub use alarm::{AlarmInfo, AlarmLevel, AlarmManager, AlarmSink, AlarmType};
pub use record::{MemoryRecordStore, RecordInfo, RecordProvider, RecordQuery, RecordType};
pub use config::{ConfigProvider, ConfigType, FileConfig};
