// 录像信息
// RecordInfo 查询的数据来源；时间串按国标格式字典序比较

use std::sync::RwLock;

/// 录像类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Time,
    Manual,
    Alarm,
    All,
}

impl RecordType {
    pub fn token(&self) -> &'static str {
        match self {
            RecordType::Time => "time",
            RecordType::Manual => "manual",
            RecordType::Alarm => "alarm",
            RecordType::All => "all",
        }
    }

    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("time") {
            RecordType::Time
        } else if token.eq_ignore_ascii_case("manual") {
            RecordType::Manual
        } else if token.eq_ignore_ascii_case("alarm") {
            RecordType::Alarm
        } else {
            RecordType::All
        }
    }
}

/// 录像信息
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub device_id: String,
    pub channel_id: String,
    /// 格式: 2024-01-01T00:00:00
    pub start_time: String,
    pub end_time: String,
    pub record_type: RecordType,
    pub file_path: String,
    pub file_size: u64,
}

/// 录像查询条件
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub channel_id: String,
    pub start_time: String,
    pub end_time: String,
    pub record_type: RecordType,
    /// 0 表示不限
    pub max_results: usize,
}

/// 录像提供者
pub trait RecordProvider: Send + Sync {
    fn query(&self, condition: &RecordQuery) -> Vec<RecordInfo>;

    /// RecordCmd 开关本地录像
    fn set_recording(&self, channel_id: &str, enable: bool) -> bool;

    /// 通道当前是否在录像，DeviceStatus 应答使用
    fn is_recording(&self, _channel_id: &str) -> bool {
        false
    }
}

/// 内存录像表适配器
pub struct MemoryRecordStore {
    records: RwLock<Vec<RecordInfo>>,
    recording: RwLock<Vec<String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            recording: RwLock::new(Vec::new()),
        }
    }

    pub fn add_record(&self, record: RecordInfo) {
        self.records
            .write()
            .expect("record table poisoned")
            .push(record);
    }

}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordProvider for MemoryRecordStore {
    fn query(&self, condition: &RecordQuery) -> Vec<RecordInfo> {
        let records = self.records.read().expect("record table poisoned");
        let mut matched: Vec<RecordInfo> = records
            .iter()
            .filter(|r| r.channel_id == condition.channel_id)
            // 时间区间有交叠即命中
            .filter(|r| r.end_time >= condition.start_time && r.start_time <= condition.end_time)
            .filter(|r| {
                condition.record_type == RecordType::All || r.record_type == condition.record_type
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        if condition.max_results > 0 {
            matched.truncate(condition.max_results);
        }
        matched
    }

    fn set_recording(&self, channel_id: &str, enable: bool) -> bool {
        let mut recording = self.recording.write().expect("recording set poisoned");
        let present = recording.iter().position(|c| c == channel_id);
        match (enable, present) {
            (true, None) => {
                recording.push(channel_id.to_string());
                tracing::info!("Recording started on channel {}", channel_id);
            }
            (false, Some(idx)) => {
                recording.remove(idx);
                tracing::info!("Recording stopped on channel {}", channel_id);
            }
            _ => {}
        }
        true
    }

    fn is_recording(&self, channel_id: &str) -> bool {
        self.recording
            .read()
            .expect("recording set poisoned")
            .iter()
            .any(|c| c == channel_id)
    }
}
