// MANSCDP XML 解析
// 国标控制报文是浅层、少属性的 XML；解析为通用节点树供分发器查询

use crate::error::{DeviceError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

/// XML 节点
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub tag: String,
    pub text: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// 第一个匹配标签的子节点（标签大小写不敏感，兼容不同厂商平台）
    pub fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|c| c.tag.eq_ignore_ascii_case(tag))
    }

    /// 子节点文本，去除首尾空白
    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).map(|c| c.text.trim())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 解析 MANSCDP 文档，返回根元素
///
/// 接受 XML 声明、注释、自闭合标签、单/双引号属性值和标准五个实体。
pub fn parse_xml(input: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(input.trim());
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let node = node_from_start(&e)?;
                stack.push(node);
            }
            Ok(Event::Empty(e)) => {
                let node = node_from_start(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| DeviceError::Xml("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| DeviceError::Xml(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    if !top.text.is_empty() {
                        top.text.push(' ');
                    }
                    top.text.push_str(text.trim());
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => return Err(DeviceError::Xml(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(DeviceError::Xml("unclosed element".to_string()));
    }
    root.ok_or_else(|| DeviceError::Xml("no root element".to_string()))
}

fn node_from_start(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlNode> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DeviceError::Xml(e.to_string()))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| DeviceError::Xml(e.to_string()))?
            .to_string();
        attributes.push((name, value));
    }
    Ok(XmlNode {
        tag,
        text: String::new(),
        attributes,
        children: Vec::new(),
    })
}

fn attach(stack: &mut Vec<XmlNode>, root: &mut Option<XmlNode>, node: XmlNode) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(DeviceError::Xml("multiple root elements".to_string()));
            }
            *root = Some(node);
            Ok(())
        }
    }
}

/// 命令类型
pub fn cmd_type(doc: &XmlNode) -> Option<&str> {
    doc.child_text("CmdType")
}

/// 请求目标设备/通道 ID
pub fn device_id(doc: &XmlNode) -> Option<&str> {
    doc.child_text("DeviceID")
}

/// 序列号，响应需原样带回
pub fn sn(doc: &XmlNode) -> Option<&str> {
    doc.child_text("SN")
}

/// DeviceControl 中的云台指令串
pub fn ptz_cmd(doc: &XmlNode) -> Option<&str> {
    doc.child_text("PTZCmd")
}

/// RecordInfo 查询条件：(通道, 开始时间, 结束时间, 录像类型)
pub fn record_info_query(doc: &XmlNode) -> Option<(String, String, String, Option<String>)> {
    let channel = device_id(doc)?.to_string();
    let start = doc.child_text("StartTime")?.to_string();
    let end = doc.child_text("EndTime")?.to_string();
    let record_type = doc.child_text("Type").map(|t| t.to_string());
    Some((channel, start, end, record_type))
}
