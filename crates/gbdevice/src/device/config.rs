// 设备配置
// 配置项为带命名空间前缀的 key=value，按配置类型选取子树

use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// 配置类型，对应 MANSCDP 的 ConfigType 取值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Basic,
    Video,
    Audio,
    Ptz,
    Storage,
    Network,
    Alarm,
    Osd,
    Privacy,
    All,
}

impl ConfigType {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigType::Basic => "BasicParam",
            ConfigType::Video => "VideoParamOpt",
            ConfigType::Audio => "AudioParamOpt",
            ConfigType::Ptz => "PTZParam",
            ConfigType::Storage => "StorageParam",
            ConfigType::Network => "NetworkParam",
            ConfigType::Alarm => "AlarmParam",
            ConfigType::Osd => "OSDParam",
            ConfigType::Privacy => "PrivacyParam",
            ConfigType::All => "All",
        }
    }

    /// key 前缀，如 video.codec
    pub fn prefix(&self) -> &'static str {
        match self {
            ConfigType::Basic => "basic",
            ConfigType::Video => "video",
            ConfigType::Audio => "audio",
            ConfigType::Ptz => "ptz",
            ConfigType::Storage => "storage",
            ConfigType::Network => "network",
            ConfigType::Alarm => "alarm",
            ConfigType::Osd => "osd",
            ConfigType::Privacy => "privacy",
            ConfigType::All => "",
        }
    }

    pub fn from_name(name: &str) -> Self {
        let lowered = name.to_ascii_lowercase();
        match lowered.as_str() {
            s if s.starts_with("basic") => ConfigType::Basic,
            s if s.starts_with("video") => ConfigType::Video,
            s if s.starts_with("audio") => ConfigType::Audio,
            s if s.starts_with("ptz") => ConfigType::Ptz,
            s if s.starts_with("storage") => ConfigType::Storage,
            s if s.starts_with("network") => ConfigType::Network,
            s if s.starts_with("alarm") => ConfigType::Alarm,
            s if s.starts_with("osd") => ConfigType::Osd,
            s if s.starts_with("privacy") => ConfigType::Privacy,
            _ => ConfigType::All,
        }
    }
}

/// 配置提供者
pub trait ConfigProvider: Send + Sync {
    /// 取配置子树，返回 (去前缀的键, 值)
    fn get(&self, config_type: ConfigType) -> Vec<(String, String)>;

    fn set(&self, config_type: ConfigType, values: &[(String, String)]) -> bool;
}

/// key=value 配置文件适配器
///
/// 一行一项，# 开头为注释；键按 `前缀.名字` 命名空间组织。
pub struct FileConfig {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// 从文件加载；文件不存在时保持默认空表
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Config file {} not found, using defaults", self.path.display());
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut entries = self.entries.write().expect("config table poisoned");
        entries.clear();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        tracing::info!("Loaded {} config entries from {}", entries.len(), self.path.display());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let entries = self.entries.read().expect("config table poisoned");
        let mut content = String::new();
        for (key, value) in entries.iter() {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .expect("config table poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_value(&self, key: &str, value: &str) {
        self.entries
            .write()
            .expect("config table poisoned")
            .insert(key.to_string(), value.to_string());
    }
}

impl ConfigProvider for FileConfig {
    fn get(&self, config_type: ConfigType) -> Vec<(String, String)> {
        let entries = self.entries.read().expect("config table poisoned");
        match config_type {
            ConfigType::All => entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            other => {
                let prefix = format!("{}.", other.prefix());
                entries
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
                    .collect()
            }
        }
    }

    fn set(&self, config_type: ConfigType, values: &[(String, String)]) -> bool {
        let mut entries = self.entries.write().expect("config table poisoned");
        for (key, value) in values {
            let full_key = if config_type == ConfigType::All {
                key.clone()
            } else {
                format!("{}.{}", config_type.prefix(), key)
            };
            entries.insert(full_key, value.clone());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_type_names() {
        assert_eq!(ConfigType::from_name("VideoParamOpt"), ConfigType::Video);
        assert_eq!(ConfigType::from_name("video"), ConfigType::Video);
        assert_eq!(ConfigType::from_name("PTZParam"), ConfigType::Ptz);
        assert_eq!(ConfigType::from_name("unknown"), ConfigType::All);
    }

    #[test]
    fn test_subtree_selection() {
        let config = FileConfig::new("/nonexistent/gbdevice.conf");
        config.set_value("video.codec", "H264");
        config.set_value("video.framerate", "25");
        config.set_value("audio.codec", "PCMA");

        let video = config.get(ConfigType::Video);
        assert_eq!(video.len(), 2);
        assert!(video.contains(&("codec".to_string(), "H264".to_string())));
        assert!(video.contains(&("framerate".to_string(), "25".to_string())));

        let all = config.get(ConfigType::All);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_set_namespaces_keys() {
        let config = FileConfig::new("/nonexistent/gbdevice.conf");
        assert!(config.set(
            ConfigType::Network,
            &[("mtu".to_string(), "1400".to_string())]
        ));
        assert_eq!(config.value("network.mtu").as_deref(), Some("1400"));
    }

    #[test]
    fn test_load_missing_file_is_ok() {
        let config = FileConfig::new("/nonexistent/gbdevice.conf");
        assert!(config.load().is_ok());
        assert!(config.get(ConfigType::All).is_empty());
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = std::env::temp_dir().join(format!("gbdevice-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("device.conf");

        let config = FileConfig::new(&path);
        config.set_value("basic.name", "Camera");
        config.set_value("video.codec", "H265");
        config.save().unwrap();

        let reloaded = FileConfig::new(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.value("video.codec").as_deref(), Some("H265"));

        // 注释与空行被忽略
        std::fs::write(&path, "# comment\n\nvideo.codec = PS\n").unwrap();
        reloaded.load().unwrap();
        assert_eq!(reloaded.value("video.codec").as_deref(), Some("PS"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
