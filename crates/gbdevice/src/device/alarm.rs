// 告警管理
// 活跃告警表 + 有界历史环，负责 Alarm Notify 报文生成与周期重报

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// 历史环容量，FIFO 淘汰
const MAX_HISTORY: usize = 1000;

/// 告警类型，国标数值编码 1-8
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmType {
    VideoLoss,
    MotionDetect,
    IoAlarm,
    StorageFailure,
    NetworkFailure,
    IllegalAccess,
    VideoBlind,
    Other,
}

impl AlarmType {
    pub fn code(&self) -> u8 {
        match self {
            AlarmType::VideoLoss => 1,
            AlarmType::MotionDetect => 2,
            AlarmType::IoAlarm => 3,
            AlarmType::StorageFailure => 4,
            AlarmType::NetworkFailure => 5,
            AlarmType::IllegalAccess => 6,
            AlarmType::VideoBlind => 7,
            AlarmType::Other => 8,
        }
    }
}

/// 告警级别，国标数值编码 1-4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlarmLevel {
    pub fn code(&self) -> u8 {
        match self {
            AlarmLevel::Info => 1,
            AlarmLevel::Warning => 2,
            AlarmLevel::Critical => 3,
            AlarmLevel::Emergency => 4,
        }
    }
}

/// 告警信息
#[derive(Debug, Clone)]
pub struct AlarmInfo {
    pub alarm_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub alarm_type: AlarmType,
    pub level: AlarmLevel,
    /// 告警方式（0=即时 1=手动 2=防区）
    pub method: String,
    pub start_time: String,
    /// 为空表示持续中
    pub end_time: String,
    pub description: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub priority: u8,
    pub attachment: Option<String>,
    pub is_active: bool,
}

impl AlarmInfo {
    pub fn new(device_id: &str, channel_id: &str, alarm_type: AlarmType, level: AlarmLevel) -> Self {
        Self {
            alarm_id: String::new(),
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            alarm_type,
            level,
            method: "0".to_string(),
            start_time: String::new(),
            end_time: String::new(),
            description: String::new(),
            longitude: None,
            latitude: None,
            priority: 1,
            attachment: None,
            is_active: false,
        }
    }
}

/// 告警上报接口，触发与周期重报都经由此回调
pub trait AlarmSink: Send + Sync {
    fn on_alarm(&self, alarm: &AlarmInfo);
}

struct AlarmState {
    active: HashMap<String, AlarmInfo>,
    history: VecDeque<AlarmInfo>,
    counter: u64,
    sn: u64,
}

/// 告警管理器
pub struct AlarmManager {
    state: Mutex<AlarmState>,
    sink: Mutex<Option<Arc<dyn AlarmSink>>>,
}

impl AlarmManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AlarmState {
                active: HashMap::new(),
                history: VecDeque::new(),
                counter: 0,
                sn: 0,
            }),
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn AlarmSink>) {
        *self.sink.lock().expect("alarm sink poisoned") = Some(sink);
    }

    /// 触发告警，返回分配的告警 ID
    ///
    /// 回调在本次调用内同步触发一次。
    pub fn trigger_alarm(&self, mut alarm: AlarmInfo) -> String {
        let snapshot = {
            let mut state = self.state.lock().expect("alarm state poisoned");
            state.counter += 1;
            // 计数段定宽，保证告警 ID 的字典序即触发顺序
            let alarm_id = format!("alarm_{}_{:06}", Utc::now().timestamp_millis(), state.counter);

            alarm.alarm_id = alarm_id.clone();
            alarm.is_active = true;
            alarm.end_time.clear();
            if alarm.start_time.is_empty() {
                alarm.start_time = gb_time_now();
            }

            if state.history.len() >= MAX_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(alarm.clone());
            state.active.insert(alarm_id, alarm.clone());
            alarm
        };

        tracing::info!(
            "Alarm triggered: {} type={} level={} channel={}",
            snapshot.alarm_id,
            snapshot.alarm_type.code(),
            snapshot.level.code(),
            snapshot.channel_id
        );

        let sink = self.sink.lock().expect("alarm sink poisoned").clone();
        if let Some(sink) = sink {
            sink.on_alarm(&snapshot);
        }

        snapshot.alarm_id
    }

    /// 清除告警：移出活跃表并补记结束时间，历史中同步更新
    pub fn clear_alarm(&self, alarm_id: &str) -> crate::Result<()> {
        let mut state = self.state.lock().expect("alarm state poisoned");
        let Some(mut alarm) = state.active.remove(alarm_id) else {
            return Err(crate::DeviceError::AlarmNotFound(alarm_id.to_string()));
        };
        alarm.is_active = false;
        alarm.end_time = gb_time_now();

        if let Some(entry) = state
            .history
            .iter_mut()
            .find(|a| a.alarm_id == alarm_id)
        {
            *entry = alarm;
        }

        tracing::info!("Alarm cleared: {}", alarm_id);
        Ok(())
    }

    pub fn active_alarms(&self) -> Vec<AlarmInfo> {
        let state = self.state.lock().expect("alarm state poisoned");
        state.active.values().cloned().collect()
    }

    /// 历史告警，按开始时间倒序；channel_id 为 None 表示全部通道
    pub fn alarm_history(&self, channel_id: Option<&str>, limit: usize) -> Vec<AlarmInfo> {
        let state = self.state.lock().expect("alarm state poisoned");
        let mut history: Vec<AlarmInfo> = state
            .history
            .iter()
            .filter(|a| channel_id.map_or(true, |c| a.channel_id == c))
            .cloned()
            .collect();
        history.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if limit > 0 {
            history.truncate(limit);
        }
        history
    }

    /// 生成 Alarm Notify 报文（MANSCDP）
    pub fn generate_alarm_notify(&self, alarm: &AlarmInfo) -> String {
        let sn = {
            let mut state = self.state.lock().expect("alarm state poisoned");
            state.sn += 1;
            state.sn
        };

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
        xml.push_str("<Notify>\r\n");
        xml.push_str("<CmdType>Alarm</CmdType>\r\n");
        xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
        xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", alarm.channel_id));
        xml.push_str(&format!("<AlarmPriority>{}</AlarmPriority>\r\n", alarm.priority));
        xml.push_str(&format!("<AlarmTime>{}</AlarmTime>\r\n", alarm.start_time));
        xml.push_str(&format!("<AlarmMethod>{}</AlarmMethod>\r\n", alarm.method));
        xml.push_str(&format!("<AlarmType>{}</AlarmType>\r\n", alarm.alarm_type.code()));
        xml.push_str(&format!("<AlarmLevel>{}</AlarmLevel>\r\n", alarm.level.code()));
        if !alarm.description.is_empty() {
            xml.push_str(&format!("<Description>{}</Description>\r\n", alarm.description));
        }
        if let (Some(lon), Some(lat)) = (alarm.longitude, alarm.latitude) {
            xml.push_str(&format!("<Longitude>{}</Longitude>\r\n", lon));
            xml.push_str(&format!("<Latitude>{}</Latitude>\r\n", lat));
        }
        if let Some(attachment) = &alarm.attachment {
            xml.push_str(&format!("<Attachment>{}</Attachment>\r\n", attachment));
        }
        xml.push_str("</Notify>\r\n");
        xml
    }

    /// 周期重报：对所有活跃告警再次触发回调，按触发顺序
    pub fn report_active(&self) {
        let mut alarms = self.active_alarms();
        alarms.sort_by(|a, b| a.alarm_id.cmp(&b.alarm_id));

        let sink = self.sink.lock().expect("alarm sink poisoned").clone();
        if let Some(sink) = sink {
            for alarm in &alarms {
                sink.on_alarm(alarm);
            }
        }
    }
}

impl Default for AlarmManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 国标时间串：YYYY-MM-DDThh:mm:ss
fn gb_time_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
