// MANSCDP 命令分发
// 按 CmdType 路由平台查询/控制，组装 Response 报文；SN 原样带回

use crate::device::config::{ConfigProvider, ConfigType};
use crate::device::info::{ChannelProvider, DeviceInfoProvider};
use crate::device::ptz::{parse_ptz_cmd, PtzController};
use crate::device::record::{RecordProvider, RecordQuery, RecordType};
use crate::error::Result;
use crate::manscdp::xml::{self, XmlNode};
use std::sync::Arc;

/// 需要引擎侧执行的控制动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Teleboot,
}

/// 分发结果：待回送平台的 Response 报文 + 引擎侧动作
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub response: Option<String>,
    pub action: Option<ControlAction>,
}

pub struct ManscdpDispatcher {
    device: Arc<dyn DeviceInfoProvider>,
    channels: Arc<dyn ChannelProvider>,
    records: Arc<dyn RecordProvider>,
    config: Arc<dyn ConfigProvider>,
    ptz: Arc<PtzController>,
}

impl ManscdpDispatcher {
    pub fn new(
        device: Arc<dyn DeviceInfoProvider>,
        channels: Arc<dyn ChannelProvider>,
        records: Arc<dyn RecordProvider>,
        config: Arc<dyn ConfigProvider>,
        ptz: Arc<PtzController>,
    ) -> Self {
        Self {
            device,
            channels,
            records,
            config,
            ptz,
        }
    }

    /// 处理一条 MANSCDP 请求报文
    ///
    /// XML 不可解析时返回 Err，由引擎回 400；可解析但命令不识别时
    /// 返回 Result=ERROR 的应答。
    pub fn handle(&self, body: &str) -> Result<DispatchResult> {
        let doc = xml::parse_xml(body)?;
        let sn = xml::sn(&doc).unwrap_or("0").to_string();
        let target = match xml::device_id(&doc) {
            Some(id) => id.to_string(),
            None => self.device.device_info().device_id,
        };

        let Some(cmd) = xml::cmd_type(&doc).map(|c| c.to_string()) else {
            tracing::warn!("MANSCDP request without CmdType");
            return Ok(DispatchResult {
                response: Some(error_response("Unknown", &sn, &target)),
                action: None,
            });
        };

        tracing::debug!("MANSCDP {} sn={} target={}", cmd, sn, target);

        let result = match cmd.as_str() {
            "Catalog" => DispatchResult {
                response: Some(self.catalog_response(&sn)),
                action: None,
            },
            "DeviceInfo" => DispatchResult {
                response: Some(self.device_info_response(&sn)),
                action: None,
            },
            "DeviceStatus" => DispatchResult {
                response: Some(self.device_status_response(&sn, &target)),
                action: None,
            },
            "RecordInfo" => DispatchResult {
                response: Some(self.record_info_response(&doc, &sn, &target)),
                action: None,
            },
            "DeviceConfig" | "ConfigDownload" => DispatchResult {
                response: Some(self.config_response(&doc, &cmd, &sn, &target)),
                action: None,
            },
            "DeviceControl" => self.handle_device_control(&doc, &sn, &target),
            other => {
                tracing::warn!("Unknown MANSCDP CmdType: {}", other);
                DispatchResult {
                    response: Some(error_response(other, &sn, &target)),
                    action: None,
                }
            }
        };

        Ok(result)
    }

    /// 目录查询应答：通道列表 + SumNum
    fn catalog_response(&self, sn: &str) -> String {
        let info = self.device.device_info();
        let channels = self.channels.channels();

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
        xml.push_str("<Response>\r\n");
        xml.push_str("<CmdType>Catalog</CmdType>\r\n");
        xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
        xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", info.device_id));
        xml.push_str(&format!("<SumNum>{}</SumNum>\r\n", channels.len()));
        xml.push_str(&format!("<DeviceList Num=\"{}\">\r\n", channels.len()));
        for channel in &channels {
            xml.push_str("<Item>\r\n");
            xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", channel.channel_id));
            xml.push_str(&format!("<Name>{}</Name>\r\n", channel.name));
            xml.push_str(&format!("<Manufacturer>{}</Manufacturer>\r\n", info.manufacturer));
            xml.push_str(&format!("<Model>{}</Model>\r\n", info.model));
            xml.push_str(&format!("<Status>{}</Status>\r\n", channel.status));
            xml.push_str(&format!("<IPAddress>{}</IPAddress>\r\n", info.ip_address));
            xml.push_str(&format!("<Port>{}</Port>\r\n", info.port));
            xml.push_str("</Item>\r\n");
        }
        xml.push_str("</DeviceList>\r\n");
        xml.push_str("</Response>\r\n");
        xml
    }

    fn device_info_response(&self, sn: &str) -> String {
        let info = self.device.device_info();
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
        xml.push_str("<Response>\r\n");
        xml.push_str("<CmdType>DeviceInfo</CmdType>\r\n");
        xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
        xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", info.device_id));
        xml.push_str(&format!("<DeviceName>{}</DeviceName>\r\n", info.device_name));
        xml.push_str(&format!("<Manufacturer>{}</Manufacturer>\r\n", info.manufacturer));
        xml.push_str(&format!("<Model>{}</Model>\r\n", info.model));
        xml.push_str(&format!("<FirmwareVersion>{}</FirmwareVersion>\r\n", info.firmware_version));
        xml.push_str("<Result>OK</Result>\r\n");
        xml.push_str("</Response>\r\n");
        xml
    }

    fn device_status_response(&self, sn: &str, target: &str) -> String {
        let info = self.device.device_info();
        let recording = self.records.is_recording(target);

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
        xml.push_str("<Response>\r\n");
        xml.push_str("<CmdType>DeviceStatus</CmdType>\r\n");
        xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
        xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", info.device_id));
        xml.push_str("<Result>OK</Result>\r\n");
        xml.push_str(&format!("<Online>{}</Online>\r\n", info.status.online_tag()));
        xml.push_str("<Status>OK</Status>\r\n");
        xml.push_str("<Encode>ON</Encode>\r\n");
        xml.push_str(&format!(
            "<Record>{}</Record>\r\n",
            if recording { "ON" } else { "OFF" }
        ));
        xml.push_str("</Response>\r\n");
        xml
    }

    fn record_info_response(&self, doc: &XmlNode, sn: &str, target: &str) -> String {
        let condition = match xml::record_info_query(doc) {
            Some((channel, start, end, kind)) => RecordQuery {
                channel_id: channel,
                start_time: start,
                end_time: end,
                record_type: kind
                    .map(|k| RecordType::from_token(&k))
                    .unwrap_or(RecordType::All),
                max_results: doc
                    .child_text("SumNum")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0),
            },
            None => {
                return error_response("RecordInfo", sn, target);
            }
        };

        let records = self.records.query(&condition);

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
        xml.push_str("<Response>\r\n");
        xml.push_str("<CmdType>RecordInfo</CmdType>\r\n");
        xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
        xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", target));
        xml.push_str(&format!("<SumNum>{}</SumNum>\r\n", records.len()));
        xml.push_str(&format!("<RecordList Num=\"{}\">\r\n", records.len()));
        for record in &records {
            xml.push_str("<Item>\r\n");
            xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", record.channel_id));
            xml.push_str(&format!("<FilePath>{}</FilePath>\r\n", record.file_path));
            xml.push_str(&format!("<StartTime>{}</StartTime>\r\n", record.start_time));
            xml.push_str(&format!("<EndTime>{}</EndTime>\r\n", record.end_time));
            xml.push_str(&format!("<Type>{}</Type>\r\n", record.record_type.token()));
            xml.push_str(&format!("<FileSize>{}</FileSize>\r\n", record.file_size));
            xml.push_str("</Item>\r\n");
        }
        xml.push_str("</RecordList>\r\n");
        xml.push_str("</Response>\r\n");
        xml
    }

    /// 配置查询/下发应答
    ///
    /// DeviceConfig 携带配置块时先应用再应答；ConfigDownload 只读。
    fn config_response(&self, doc: &XmlNode, cmd: &str, sn: &str, target: &str) -> String {
        let config_type = doc
            .child_text("ConfigType")
            .map(ConfigType::from_name)
            .unwrap_or(ConfigType::All);

        if cmd == "DeviceConfig" {
            if let Some(block) = doc.child(config_type.name()) {
                let values: Vec<(String, String)> = block
                    .children
                    .iter()
                    .map(|c| (c.tag.clone(), c.text.trim().to_string()))
                    .collect();
                if !values.is_empty() && !self.config.set(config_type, &values) {
                    return error_response(cmd, sn, target);
                }
            }
        }

        let entries = self.config.get(config_type);

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
        xml.push_str("<Response>\r\n");
        xml.push_str(&format!("<CmdType>{}</CmdType>\r\n", cmd));
        xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
        xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", target));
        xml.push_str("<Result>OK</Result>\r\n");
        if config_type != ConfigType::All {
            xml.push_str(&format!("<{}>\r\n", config_type.name()));
            for (key, value) in &entries {
                xml.push_str(&format!("<{}>{}</{}>\r\n", key, value, key));
            }
            xml.push_str(&format!("</{}>\r\n", config_type.name()));
        }
        xml.push_str("</Response>\r\n");
        xml
    }

    fn handle_device_control(&self, doc: &XmlNode, sn: &str, target: &str) -> DispatchResult {
        if let Some(cmd_str) = xml::ptz_cmd(doc) {
            let ok = match parse_ptz_cmd(target, cmd_str) {
                Ok(command) => self.ptz.execute(&command),
                Err(e) => {
                    tracing::warn!("Bad PTZCmd {:?}: {}", cmd_str, e);
                    false
                }
            };
            return DispatchResult {
                response: Some(control_response(sn, target, ok)),
                action: None,
            };
        }

        if doc.child("TeleBoot").is_some() {
            tracing::info!("TeleBoot requested by platform");
            return DispatchResult {
                response: Some(control_response(sn, target, true)),
                action: Some(ControlAction::Teleboot),
            };
        }

        if let Some(record_cmd) = doc.child_text("RecordCmd") {
            let enable = record_cmd.eq_ignore_ascii_case("Record");
            let ok = self.records.set_recording(target, enable);
            return DispatchResult {
                response: Some(control_response(sn, target, ok)),
                action: None,
            };
        }

        tracing::warn!("DeviceControl without recognised command");
        DispatchResult {
            response: Some(control_response(sn, target, false)),
            action: None,
        }
    }
}

fn control_response(sn: &str, device_id: &str, ok: bool) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
    xml.push_str("<Response>\r\n");
    xml.push_str("<CmdType>DeviceControl</CmdType>\r\n");
    xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
    xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", device_id));
    xml.push_str(&format!("<Result>{}</Result>\r\n", if ok { "OK" } else { "ERROR" }));
    xml.push_str("</Response>\r\n");
    xml
}

fn error_response(cmd: &str, sn: &str, device_id: &str) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n");
    xml.push_str("<Response>\r\n");
    xml.push_str(&format!("<CmdType>{}</CmdType>\r\n", cmd));
    xml.push_str(&format!("<SN>{}</SN>\r\n", sn));
    xml.push_str(&format!("<DeviceID>{}</DeviceID>\r\n", device_id));
    xml.push_str("<Result>ERROR</Result>\r\n");
    xml.push_str("</Response>\r\n");
    xml
}
