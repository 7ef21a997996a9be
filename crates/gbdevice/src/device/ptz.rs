// 云台控制
// 解析国标 PTZCmd 指令串，映射为硬件无关的动作集

use crate::error::{DeviceError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 八方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtzDirection {
    Up,
    Down,
    Left,
    Right,
    UpLeft,
    DownLeft,
    UpRight,
    DownRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusDirection {
    Near,
    Far,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrisDirection {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetOp {
    Call,
    Set,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CruiseOp {
    Start,
    Stop,
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOp {
    Start,
    Stop,
}

/// 云台动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtzAction {
    Stop,
    Move(PtzDirection),
    Zoom(ZoomDirection),
    Focus(FocusDirection),
    Iris(IrisDirection),
    Preset(PresetOp, u8),
    Cruise(CruiseOp, u8),
    Scan(ScanOp),
}

/// 一次云台控制命令
#[derive(Debug, Clone)]
pub struct PtzCommand {
    pub channel_id: String,
    pub action: PtzAction,
    /// 1-255
    pub speed: u8,
    pub dwell_time: Option<u32>,
}

/// 解析 PTZCmd 指令串
///
/// 形如 `Command=3&Speed=200&PresetID=1`，分隔符为 & 或空白。
pub fn parse_ptz_cmd(channel_id: &str, input: &str) -> Result<PtzCommand> {
    let mut command: Option<i32> = None;
    let mut speed: u8 = 128;
    let mut preset_id: u8 = 0;
    let mut cruise_id: u8 = 0;
    let mut dwell_time: Option<u32> = None;

    for pair in input.split(|c: char| c == '&' || c.is_whitespace()) {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "Command" => {
                command = Some(value.parse().map_err(|_| {
                    DeviceError::Other(format!("Invalid PTZ command code: {}", value))
                })?);
            }
            "Speed" => {
                let raw: u32 = value.parse().unwrap_or(128);
                speed = raw.clamp(1, 255) as u8;
            }
            "PresetID" => {
                preset_id = value.parse().unwrap_or(0);
            }
            "CruiseID" => {
                cruise_id = value.parse().unwrap_or(0);
            }
            "DwellTime" => {
                dwell_time = value.parse().ok();
            }
            _ => {}
        }
    }

    let code = command.ok_or_else(|| DeviceError::Other("Missing PTZ Command".to_string()))?;
    let action = match code {
        0 => PtzAction::Stop,
        1 => PtzAction::Move(PtzDirection::Up),
        2 => PtzAction::Move(PtzDirection::Down),
        3 => PtzAction::Move(PtzDirection::Left),
        4 => PtzAction::Move(PtzDirection::Right),
        5 => PtzAction::Move(PtzDirection::UpLeft),
        6 => PtzAction::Move(PtzDirection::DownLeft),
        7 => PtzAction::Move(PtzDirection::UpRight),
        8 => PtzAction::Move(PtzDirection::DownRight),
        11 => PtzAction::Zoom(ZoomDirection::In),
        12 => PtzAction::Zoom(ZoomDirection::Out),
        13 => PtzAction::Focus(FocusDirection::Near),
        14 => PtzAction::Focus(FocusDirection::Far),
        15 => PtzAction::Iris(IrisDirection::Open),
        16 => PtzAction::Iris(IrisDirection::Close),
        21 => PtzAction::Preset(PresetOp::Call, preset_id),
        22 => PtzAction::Preset(PresetOp::Set, preset_id),
        23 => PtzAction::Preset(PresetOp::Delete, preset_id),
        31 => PtzAction::Cruise(CruiseOp::Start, cruise_id),
        32 => PtzAction::Cruise(CruiseOp::Stop, cruise_id),
        33 => PtzAction::Cruise(CruiseOp::Add, cruise_id),
        41 => PtzAction::Scan(ScanOp::Start),
        42 => PtzAction::Scan(ScanOp::Stop),
        other => {
            return Err(DeviceError::Other(format!(
                "Unknown PTZ command code: {}",
                other
            )))
        }
    };

    Ok(PtzCommand {
        channel_id: channel_id.to_string(),
        action,
        speed,
        dwell_time,
    })
}

/// 硬件云台接口
pub trait HardwarePtzSink: Send + Sync {
    fn apply(&self, command: &PtzCommand) -> bool;
}

/// 预置位
#[derive(Debug, Clone)]
pub struct PtzPreset {
    pub preset_id: u8,
    pub name: String,
}

/// 巡航路径
#[derive(Debug, Clone, Default)]
pub struct PtzCruisePath {
    pub cruise_id: u8,
    pub speeds: Vec<u8>,
    pub dwell_times: Vec<u32>,
}

/// 云台控制器
///
/// 维护各通道的预置位与巡航路径，动作统一下发给硬件接口；
/// 硬件返回 false 时命令按失败上报。
pub struct PtzController {
    sink: Arc<dyn HardwarePtzSink>,
    presets: RwLock<HashMap<String, HashMap<u8, PtzPreset>>>,
    cruises: RwLock<HashMap<String, HashMap<u8, PtzCruisePath>>>,
}

impl PtzController {
    pub fn new(sink: Arc<dyn HardwarePtzSink>) -> Self {
        Self {
            sink,
            presets: RwLock::new(HashMap::new()),
            cruises: RwLock::new(HashMap::new()),
        }
    }

    /// 执行命令：先做本地簿记，再驱动硬件
    pub fn execute(&self, command: &PtzCommand) -> bool {
        match command.action {
            PtzAction::Preset(PresetOp::Set, id) if id > 0 => {
                let mut presets = self.presets.write().expect("preset table poisoned");
                presets.entry(command.channel_id.clone()).or_default().insert(
                    id,
                    PtzPreset {
                        preset_id: id,
                        name: format!("Preset {}", id),
                    },
                );
            }
            PtzAction::Preset(PresetOp::Delete, id) => {
                let mut presets = self.presets.write().expect("preset table poisoned");
                if let Some(table) = presets.get_mut(&command.channel_id) {
                    table.remove(&id);
                }
            }
            PtzAction::Preset(PresetOp::Call, id) => {
                let presets = self.presets.read().expect("preset table poisoned");
                let known = presets
                    .get(&command.channel_id)
                    .map(|t| t.contains_key(&id))
                    .unwrap_or(false);
                if !known {
                    tracing::warn!(
                        "PTZ call of unknown preset {} on channel {}",
                        id,
                        command.channel_id
                    );
                }
            }
            PtzAction::Cruise(CruiseOp::Add, id) if id > 0 => {
                let mut cruises = self.cruises.write().expect("cruise table poisoned");
                let path = cruises
                    .entry(command.channel_id.clone())
                    .or_default()
                    .entry(id)
                    .or_default();
                path.cruise_id = id;
                path.speeds.push(command.speed);
                path.dwell_times.push(command.dwell_time.unwrap_or(5));
            }
            _ => {}
        }

        let ok = self.sink.apply(command);
        tracing::debug!(
            "PTZ {:?} speed={} channel={} -> {}",
            command.action,
            command.speed,
            command.channel_id,
            if ok { "OK" } else { "ERROR" }
        );
        ok
    }

    pub fn presets(&self, channel_id: &str) -> Vec<PtzPreset> {
        self.presets
            .read()
            .expect("preset table poisoned")
            .get(channel_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cruise_path(&self, channel_id: &str, cruise_id: u8) -> Option<PtzCruisePath> {
        self.cruises
            .read()
            .expect("cruise table poisoned")
            .get(channel_id)
            .and_then(|t| t.get(&cruise_id))
            .cloned()
    }
}
