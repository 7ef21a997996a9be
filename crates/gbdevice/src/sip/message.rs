// SIP 消息解析和生成
// 支持 GB28181 平台常见的消息格式：宽松行结束符、头部折行、紧凑头部名

use crate::error::{DeviceError, Result};
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Info => write!(f, "INFO"),
            SipMethod::Options => write!(f, "OPTIONS"),
        }
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

/// 紧凑头部名 -> 标准头部名
fn expand_compact_name(name: &str) -> Option<&'static str> {
    if name.len() != 1 {
        return None;
    }
    match name.as_bytes()[0].to_ascii_lowercase() {
        b'f' => Some("From"),
        b't' => Some("To"),
        b'i' => Some("Call-ID"),
        b'm' => Some("Contact"),
        b'v' => Some("Via"),
        b'c' => Some("Content-Type"),
        b'l' => Some("Content-Length"),
        _ => None,
    }
}

/// 有序头部表
///
/// 保留接收顺序和原始写法，查找时按标准名大小写不敏感匹配；
/// 紧凑形式在入表时展开为标准名。
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let name = match expand_compact_name(&name) {
            Some(long) => long.to_string(),
            None => name,
        };
        self.entries.push((name, value.into()));
    }

    /// 获取第一个匹配头部的值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 替换第一个匹配头部，不存在时追加
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.push(name.to_string(), value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn serialize_into(&self, out: &mut String, body_len: usize) {
        for (name, value) in &self.entries {
            // Content-Length 固定按实际消息体重写
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n", body_len));
    }
}

/// 解析头部区 + 消息体，起始行由调用方先行取走
fn parse_head(s: &str) -> Result<(String, Headers, String)> {
    let mut lines = LineCursor::new(s);

    let start_line = lines
        .next_line()
        .ok_or_else(|| DeviceError::MalformedStartLine("empty message".to_string()))?
        .to_string();
    if start_line.trim().is_empty() {
        return Err(DeviceError::MalformedStartLine("empty start line".to_string()));
    }

    let mut headers = Headers::new();
    loop {
        let line = match lines.next_line() {
            Some(l) => l,
            None => break, // 无空行分隔时按无消息体处理
        };
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // 折行：拼接到上一个头部值
            match headers.entries.last_mut() {
                Some((_, v)) => {
                    v.push(' ');
                    v.push_str(line.trim());
                }
                None => {
                    return Err(DeviceError::MalformedHeader(line.to_string()));
                }
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| DeviceError::MalformedHeader(line.to_string()))?;
        if name.trim().is_empty() {
            return Err(DeviceError::MalformedHeader(line.to_string()));
        }
        headers.push(name.trim().to_string(), value.trim().to_string());
    }

    let rest = lines.rest();
    let body = match headers
        .get("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        Some(declared) => {
            let actual = rest.len();
            if actual < declared {
                return Err(DeviceError::TruncatedBody { declared, actual });
            }
            match rest.get(..declared) {
                Some(prefix) => prefix.to_string(),
                None => rest.to_string(),
            }
        }
        None => rest.to_string(),
    };

    Ok((start_line, headers, body))
}

/// 按 \r\n 或 \n 切行的游标，记录消息体起点
struct LineCursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> LineCursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn next_line(&mut self) -> Option<&'a str> {
        if self.pos >= self.input.len() {
            return None;
        }
        let rest = &self.input[self.pos..];
        match rest.find('\n') {
            Some(idx) => {
                let line = &rest[..idx];
                self.pos += idx + 1;
                Some(line.strip_suffix('\r').unwrap_or(line))
            }
            None => {
                self.pos = self.input.len();
                Some(rest)
            }
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos.min(self.input.len())..]
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// 从字符串解析 SIP 请求
    pub fn from_string(s: &str) -> Result<Self> {
        let (start_line, headers, body) = parse_head(s)?;

        let mut parts = start_line.split_whitespace();
        let method_token = parts
            .next()
            .ok_or_else(|| DeviceError::MalformedStartLine(start_line.clone()))?;
        let uri = parts
            .next()
            .ok_or_else(|| DeviceError::MalformedStartLine(start_line.clone()))?;
        let version = parts
            .next()
            .ok_or_else(|| DeviceError::MalformedStartLine(start_line.clone()))?;
        if parts.next().is_some() || !version.starts_with("SIP/") {
            return Err(DeviceError::MalformedStartLine(start_line.clone()));
        }

        let method = SipMethod::parse(method_token)
            .ok_or_else(|| DeviceError::MalformedStartLine(start_line.clone()))?;

        Ok(Self {
            method,
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body: if body.is_empty() { None } else { Some(body) },
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.as_deref().unwrap_or("");
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.headers.serialize_into(&mut out, body.len());
        out.push_str("\r\n");
        out.push_str(body);
        f.write_str(&out)
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// 从字符串解析 SIP 响应
    pub fn from_string(s: &str) -> Result<Self> {
        let (start_line, headers, body) = parse_head(s)?;

        let mut parts = start_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| DeviceError::MalformedStartLine(start_line.clone()))?;
        if !version.starts_with("SIP/") {
            return Err(DeviceError::MalformedStartLine(start_line.clone()));
        }
        let status_code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| DeviceError::MalformedStartLine(start_line.clone()))?;
        let reason_phrase = parts.next().unwrap_or("").to_string();

        Ok(Self {
            version: version.to_string(),
            status_code,
            reason_phrase,
            headers,
            body: if body.is_empty() { None } else { Some(body) },
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.as_deref().unwrap_or("");
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        );
        self.headers.serialize_into(&mut out, body.len());
        out.push_str("\r\n");
        out.push_str(body);
        f.write_str(&out)
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 首行以 SIP/2.0 开头的是响应，其余按请求解析
    pub fn from_string(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::from_string(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_string(s)?))
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => fmt::Display::fmt(req, f),
            SipMessage::Response(resp) => fmt::Display::fmt(resp, f),
        }
    }
}
