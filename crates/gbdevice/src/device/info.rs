// 设备与通道信息
// 目录/设备信息/设备状态查询的数据来源

use std::sync::RwLock;

/// 设备状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
    Registering,
}

impl DeviceStatus {
    pub fn online_tag(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "ONLINE",
            _ => "OFFLINE",
        }
    }
}

/// 设备信息（20 位国标编码）
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub ip_address: String,
    pub port: u16,
    pub status: DeviceStatus,
}

/// 设备通道
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub name: String,
    /// 0=主码流 1=子码流
    pub channel_type: u8,
    /// ON/OFF
    pub status: String,
}

/// 设备信息提供者
pub trait DeviceInfoProvider: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
    fn set_status(&self, status: DeviceStatus);
}

/// 通道列表提供者
pub trait ChannelProvider: Send + Sync {
    fn channels(&self) -> Vec<ChannelInfo>;
}

/// 静态设备适配器：进程内固定的设备信息与通道表
pub struct StaticDevice {
    info: RwLock<DeviceInfo>,
    channels: RwLock<Vec<ChannelInfo>>,
}

impl StaticDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info: RwLock::new(info),
            channels: RwLock::new(Vec::new()),
        }
    }

    pub fn add_channel(&self, channel: ChannelInfo) {
        self.channels
            .write()
            .expect("channel table poisoned")
            .push(channel);
    }
}

impl DeviceInfoProvider for StaticDevice {
    fn device_info(&self) -> DeviceInfo {
        self.info.read().expect("device info poisoned").clone()
    }

    fn set_status(&self, status: DeviceStatus) {
        let mut info = self.info.write().expect("device info poisoned");
        if info.status != status {
            tracing::info!("Device status: {:?} -> {:?}", info.status, status);
            info.status = status;
        }
    }
}

impl ChannelProvider for StaticDevice {
    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.read().expect("channel table poisoned").clone()
    }
}
