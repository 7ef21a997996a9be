// SIP 引擎
// 设备侧信令中枢：注册保活、入站分发、媒体协商；单线程协作式，
// 每次 step 只处理一个事件，仅在收包/收命令处挂起

use crate::device::alarm::{AlarmInfo, AlarmManager};
use crate::device::info::{DeviceInfoProvider, DeviceStatus};
use crate::error::{DeviceError, Result};
use crate::manscdp::dispatcher::{ControlAction, ManscdpDispatcher};
use crate::sip::auth::{build_authorization, parse_digest_challenge};
use crate::sip::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::sdp::{self, SdpSession};
use crate::sip::session::{MediaSessionManager, SessionState};
use crate::sip::transport::SipTransport;
use chrono::Utc;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// REGISTER 事务超时（RFC 3261 Timer F）
const REGISTER_TIMEOUT: Duration = Duration::from_secs(32);

const USER_AGENT: &str = "GBDevice/0.1";

/// 注册状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    NotRegistered,
    Challenging,
    Registered,
    Expired,
}

/// 引擎对外事件
#[derive(Debug, Clone)]
pub enum SipEvent {
    RegisterSuccess,
    RegisterFailed(String),
    AuthFailed,
    RegistrationExpired,
    KeepaliveSent,
    InviteAccepted { call_id: String },
    SessionEstablished { call_id: String },
    SessionTerminated { call_id: String },
    TelebootRequested,
}

/// 事件回调接口
pub trait SipEventHandler: Send + Sync {
    fn on_event(&self, event: &SipEvent);
}

/// 周期任务通过命令队列回注到引擎事件循环
#[derive(Debug)]
pub enum EngineCommand {
    SendKeepalive,
    ReportAlarms,
    SweepSessions,
    NotifyAlarm(AlarmInfo),
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct SipEngineConfig {
    /// "auto" 表示自动探测
    pub local_ip: String,
    pub local_port: u16,
    pub device_id: String,
    /// SIP 域（国标 10 位编码）
    pub realm: String,
    pub server_ip: String,
    pub server_port: u16,
    pub username: String,
    pub password: String,
    /// 注册有效期（秒）
    pub expires: u32,
    /// 会话无活动超时（秒）
    pub session_timeout: i64,
}

impl Default for SipEngineConfig {
    fn default() -> Self {
        Self {
            local_ip: "auto".to_string(),
            local_port: 5060,
            device_id: "34020000001320000001".to_string(),
            realm: "3402000000".to_string(),
            server_ip: "192.168.1.1".to_string(),
            server_port: 5060,
            username: "34020000001320000001".to_string(),
            password: "12345678".to_string(),
            expires: 3600,
            session_timeout: 300,
        }
    }
}

enum Wake {
    Datagram(Vec<u8>, SocketAddr),
    Command(EngineCommand),
    Timeout,
}

/// GB28181 设备 SIP 引擎
pub struct SipEngine {
    config: SipEngineConfig,
    transport: SipTransport,
    server_addr: SocketAddr,

    registration: RegistrationState,
    reg_call_id: String,
    reg_cseq: u32,
    reg_sent_at: Option<Instant>,
    next_register_at: Option<Instant>,
    expires_at: Option<Instant>,
    /// 本轮注册是否已带凭据重发过
    challenge_answered: bool,

    local_tag: String,
    cseq: u32,
    sn: u32,

    sessions: MediaSessionManager,
    dispatcher: ManscdpDispatcher,
    alarms: Arc<AlarmManager>,
    device: Arc<dyn DeviceInfoProvider>,
    events: Option<Arc<dyn SipEventHandler>>,

    cmd_tx: mpsc::Sender<EngineCommand>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
}

impl SipEngine {
    pub async fn new(
        config: SipEngineConfig,
        dispatcher: ManscdpDispatcher,
        sessions: MediaSessionManager,
        alarms: Arc<AlarmManager>,
        device: Arc<dyn DeviceInfoProvider>,
    ) -> Result<Self> {
        let transport = SipTransport::bind(&config.local_ip, config.local_port).await?;
        let server_addr: SocketAddr = format!("{}:{}", config.server_ip, config.server_port)
            .parse()
            .map_err(|e| DeviceError::Other(format!("Invalid server address: {}", e)))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let local_tag = format!("{:08x}", rand::thread_rng().gen::<u32>());

        tracing::info!(
            "SIP engine up: device={} local={} server={}",
            config.device_id,
            transport.local_addr(),
            server_addr
        );

        Ok(Self {
            config,
            transport,
            server_addr,
            registration: RegistrationState::NotRegistered,
            reg_call_id: String::new(),
            reg_cseq: 0,
            reg_sent_at: None,
            next_register_at: None,
            expires_at: None,
            challenge_answered: false,
            local_tag,
            cseq: 0,
            sn: 0,
            sessions,
            dispatcher,
            alarms,
            device,
            events: None,
            cmd_tx,
            cmd_rx,
        })
    }

    pub fn set_event_handler(&mut self, handler: Arc<dyn SipEventHandler>) {
        self.events = Some(handler);
    }

    /// 周期任务持有的命令入口
    pub fn command_sender(&self) -> mpsc::Sender<EngineCommand> {
        self.cmd_tx.clone()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn sessions(&self) -> MediaSessionManager {
        self.sessions.clone()
    }

    fn emit(&self, event: SipEvent) {
        tracing::debug!("SIP event: {:?}", event);
        if let Some(handler) = &self.events {
            handler.on_event(&event);
        }
    }

    /// 发起注册：先发不带凭据的 REGISTER，等待 401 挑战
    pub async fn register(&mut self) -> Result<()> {
        self.reg_call_id = format!("{:08x}@{}", rand::thread_rng().gen::<u32>(), self.config.realm);
        self.reg_cseq = 1;
        self.challenge_answered = false;

        let request = self.build_register(self.config.expires, None);
        self.send_request(&request).await?;

        self.registration = RegistrationState::Challenging;
        self.reg_sent_at = Some(Instant::now());
        self.device.set_status(DeviceStatus::Registering);

        tracing::info!("REGISTER sent to {}", self.server_addr);
        Ok(())
    }

    /// 注销：Expires=0 的 REGISTER
    pub async fn unregister(&mut self) -> Result<()> {
        if self.registration != RegistrationState::Registered {
            return Ok(());
        }
        self.reg_cseq += 1;
        let request = self.build_register(0, None);
        self.send_request(&request).await?;

        self.registration = RegistrationState::NotRegistered;
        self.next_register_at = None;
        self.expires_at = None;
        self.device.set_status(DeviceStatus::Offline);

        tracing::info!("UNREGISTER sent");
        Ok(())
    }

    /// 处理最多一个事件：入站报文 / 周期命令 / 超时
    pub async fn step(&mut self, timeout: Duration) -> Result<()> {
        self.run_timers().await?;

        let wake = tokio::select! {
            received = self.transport.recv_from() => match received {
                Ok((data, addr)) => Wake::Datagram(data, addr),
                Err(e) => {
                    tracing::warn!("SIP recv failed: {}", e);
                    Wake::Timeout
                }
            },
            command = self.cmd_rx.recv() => match command {
                Some(command) => Wake::Command(command),
                None => Wake::Timeout,
            },
            _ = tokio::time::sleep(timeout) => Wake::Timeout,
        };

        match wake {
            Wake::Datagram(data, addr) => self.handle_datagram(&data, addr).await,
            Wake::Command(command) => self.handle_command(command).await,
            Wake::Timeout => Ok(()),
        }
    }

    /// 到期定时器：注册事务超时、重注册、注册过期
    async fn run_timers(&mut self) -> Result<()> {
        let now = Instant::now();

        if self.registration == RegistrationState::Challenging {
            if let Some(sent_at) = self.reg_sent_at {
                if now.duration_since(sent_at) > REGISTER_TIMEOUT {
                    tracing::warn!("REGISTER transaction timed out");
                    self.registration = RegistrationState::NotRegistered;
                    self.reg_sent_at = None;
                    self.device.set_status(DeviceStatus::Offline);
                    self.emit(SipEvent::RegisterFailed("transaction timeout".to_string()));
                }
            }
        }

        if self.registration == RegistrationState::Registered {
            if let Some(expires_at) = self.expires_at {
                if now >= expires_at {
                    tracing::warn!("Registration expired");
                    self.registration = RegistrationState::Expired;
                    self.device.set_status(DeviceStatus::Offline);
                    self.emit(SipEvent::RegistrationExpired);
                    return Ok(());
                }
            }
            if let Some(due) = self.next_register_at {
                if now >= due {
                    tracing::info!("Re-registering before expiry");
                    self.next_register_at = None;
                    self.register().await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        let text = String::from_utf8_lossy(data);
        let message = match SipMessage::from_string(&text) {
            Ok(message) => message,
            Err(e) => {
                // 不可解析的报文直接丢弃，不回 400，避免放大
                tracing::warn!("Dropped unparseable packet from {}: {}", addr, e);
                return Ok(());
            }
        };

        match message {
            SipMessage::Request(request) => self.handle_request(request, addr).await,
            SipMessage::Response(response) => self.handle_response(response).await,
        }
    }

    async fn handle_request(&mut self, request: SipRequest, addr: SocketAddr) -> Result<()> {
        tracing::debug!("{} from {}", request.method, addr);
        match request.method {
            SipMethod::Message => self.handle_message(request, addr).await,
            SipMethod::Invite => self.handle_invite(request, addr).await,
            SipMethod::Ack => self.handle_ack(request).await,
            SipMethod::Bye => self.handle_bye(request, addr).await,
            SipMethod::Options => self.handle_options(request, addr).await,
            _ => {
                let response = build_response(&request, 405, "Method Not Allowed");
                self.send_response(&response, addr).await
            }
        }
    }

    /// 驱动注册状态机
    async fn handle_response(&mut self, response: SipResponse) -> Result<()> {
        let is_register = response.call_id() == Some(self.reg_call_id.as_str())
            && response
                .header("CSeq")
                .map(|c| c.contains("REGISTER"))
                .unwrap_or(false);
        if !is_register {
            tracing::debug!(
                "Ignoring response {} {} outside REGISTER transaction",
                response.status_code,
                response.reason_phrase
            );
            return Ok(());
        }
        if self.registration != RegistrationState::Challenging {
            return Ok(());
        }

        match response.status_code {
            401 | 407 => self.handle_register_challenge(&response).await,
            200..=299 => {
                let expires = response
                    .header("Expires")
                    .and_then(|e| e.trim().parse::<u64>().ok())
                    .unwrap_or(self.config.expires as u64);

                self.registration = RegistrationState::Registered;
                self.reg_sent_at = None;
                self.expires_at = Some(Instant::now() + Duration::from_secs(expires));
                // 有效期 80% 处重注册
                self.next_register_at =
                    Some(Instant::now() + Duration::from_secs(expires * 8 / 10));
                self.device.set_status(DeviceStatus::Online);

                tracing::info!("Registered, expires in {}s", expires);
                self.emit(SipEvent::RegisterSuccess);
                Ok(())
            }
            code => {
                tracing::warn!("REGISTER rejected: {} {}", code, response.reason_phrase);
                self.registration = RegistrationState::NotRegistered;
                self.reg_sent_at = None;
                self.device.set_status(DeviceStatus::Offline);
                self.emit(SipEvent::RegisterFailed(format!(
                    "{} {}",
                    code, response.reason_phrase
                )));
                Ok(())
            }
        }
    }

    async fn handle_register_challenge(&mut self, response: &SipResponse) -> Result<()> {
        // 第二次 401 视为凭据错误
        if self.challenge_answered {
            tracing::error!("Authentication rejected by platform");
            self.registration = RegistrationState::NotRegistered;
            self.reg_sent_at = None;
            self.device.set_status(DeviceStatus::Offline);
            self.emit(SipEvent::AuthFailed);
            return Ok(());
        }

        let challenge = response
            .header("WWW-Authenticate")
            .or_else(|| response.header("Proxy-Authenticate"))
            .and_then(parse_digest_challenge);
        let Some(challenge) = challenge else {
            tracing::error!("401 without parseable challenge");
            self.registration = RegistrationState::NotRegistered;
            self.reg_sent_at = None;
            self.emit(SipEvent::RegisterFailed("bad challenge".to_string()));
            return Ok(());
        };

        let uri = format!("sip:{}", self.config.realm);
        let Some(authorization) = build_authorization(
            &self.config.username,
            &self.config.password,
            "REGISTER",
            &uri,
            &challenge,
        ) else {
            self.registration = RegistrationState::NotRegistered;
            self.emit(SipEvent::AuthFailed);
            return Ok(());
        };

        self.reg_cseq += 1;
        self.challenge_answered = true;
        let request = self.build_register(self.config.expires, Some(&authorization));
        self.send_request(&request).await?;
        self.reg_sent_at = Some(Instant::now());

        tracing::info!("REGISTER re-sent with digest credentials");
        Ok(())
    }

    async fn handle_message(&mut self, request: SipRequest, addr: SocketAddr) -> Result<()> {
        let is_manscdp = request
            .header("Content-Type")
            .map(|c| c.to_ascii_lowercase().contains("manscdp"))
            .unwrap_or(false);

        let Some(body) = request.body.clone().filter(|_| is_manscdp) else {
            let response = build_response(&request, 200, "OK");
            return self.send_response(&response, addr).await;
        };

        match self.dispatcher.handle(&body) {
            Ok(result) => {
                let response = build_response(&request, 200, "OK");
                self.send_response(&response, addr).await?;

                if let Some(body) = result.response {
                    self.send_manscdp(body).await?;
                }
                if result.action == Some(ControlAction::Teleboot) {
                    self.emit(SipEvent::TelebootRequested);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Malformed MANSCDP body: {}", e);
                let response = build_response(&request, 400, "Bad Request");
                self.send_response(&response, addr).await
            }
        }
    }

    async fn handle_invite(&mut self, request: SipRequest, addr: SocketAddr) -> Result<()> {
        let Some(call_id) = request.call_id().map(|c| c.to_string()) else {
            let response = build_response(&request, 400, "Bad Request");
            return self.send_response(&response, addr).await;
        };

        let offer = request
            .body
            .as_deref()
            .ok_or_else(|| DeviceError::MalformedSdp("INVITE without SDP".to_string()))
            .and_then(SdpSession::from_string)
            .and_then(|session| sdp::negotiate_offer(&session));
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!("Rejecting INVITE {}: {}", call_id, e);
                let response = build_response(&request, 400, "Bad Request");
                return self.send_response(&response, addr).await;
            }
        };

        let channel_id = uri_user(&request.uri)
            .unwrap_or(&self.config.device_id)
            .to_string();
        let audio_codec = offer
            .audio
            .as_ref()
            .map(|a| a.codec)
            .unwrap_or(sdp::AudioCodec::Pcma);

        let created = self
            .sessions
            .create_session(&call_id, &channel_id, &offer.remote_ip, offer.video_codec, audio_codec)
            .await;
        if let Err(e) = created {
            tracing::error!("INVITE {} failed: {}", call_id, e);
            let response = build_response(&request, 500, "Server Internal Error");
            return self.send_response(&response, addr).await;
        }

        let remote_audio = offer.audio.as_ref().map(|a| a.port).unwrap_or(0);
        self.sessions
            .set_remote_ports(&call_id, offer.video_port, remote_audio)
            .await?;

        let (video_port, audio_port) = match self.sessions.allocate_local_ports(&call_id).await {
            Ok(ports) => ports,
            Err(e) => {
                tracing::error!("Port allocation failed for {}: {}", call_id, e);
                self.sessions.terminate_session(&call_id).await.ok();
                let response = build_response(&request, 500, "Server Internal Error");
                return self.send_response(&response, addr).await;
            }
        };

        let local_ip = self.transport.local_addr().ip().to_string();
        let session_id = Utc::now().timestamp().to_string();
        let answer = sdp::build_answer(&local_ip, &session_id, video_port, audio_port, &offer);

        let mut response = build_response(&request, 200, "OK");
        response.add_header("Contact", self.contact_header());
        response.add_header("Content-Type", "application/sdp");
        response.set_body(answer);
        self.send_response(&response, addr).await?;

        tracing::info!(
            "INVITE accepted: {} channel={} video={}:{} -> local {}",
            call_id,
            channel_id,
            offer.remote_ip,
            offer.video_port,
            video_port
        );
        self.emit(SipEvent::InviteAccepted { call_id });
        Ok(())
    }

    async fn handle_ack(&mut self, request: SipRequest) -> Result<()> {
        let Some(call_id) = request.call_id().map(|c| c.to_string()) else {
            return Ok(());
        };

        match self
            .sessions
            .update_state(&call_id, SessionState::Established)
            .await
        {
            Ok(()) => {
                self.sessions.update_activity(&call_id).await.ok();
                self.emit(SipEvent::SessionEstablished { call_id });
            }
            Err(e) => {
                tracing::warn!("ACK for {}: {}", call_id, e);
            }
        }
        Ok(())
    }

    async fn handle_bye(&mut self, request: SipRequest, addr: SocketAddr) -> Result<()> {
        if let Some(call_id) = request.call_id().map(|c| c.to_string()) {
            match self.sessions.terminate_session(&call_id).await {
                Ok(_) => self.emit(SipEvent::SessionTerminated { call_id }),
                Err(e) => tracing::warn!("BYE for unknown session: {}", e),
            }
        }

        let response = build_response(&request, 200, "OK");
        self.send_response(&response, addr).await
    }

    async fn handle_options(&mut self, request: SipRequest, addr: SocketAddr) -> Result<()> {
        let mut response = build_response(&request, 200, "OK");
        response.add_header(
            "Allow",
            "REGISTER, INVITE, ACK, BYE, OPTIONS, MESSAGE, INFO, NOTIFY",
        );
        self.send_response(&response, addr).await
    }

    async fn handle_command(&mut self, command: EngineCommand) -> Result<()> {
        match command {
            EngineCommand::SendKeepalive => self.send_keepalive().await,
            EngineCommand::ReportAlarms => {
                self.alarms.report_active();
                Ok(())
            }
            EngineCommand::SweepSessions => {
                let swept = self
                    .sessions
                    .cleanup_timeout(self.config.session_timeout)
                    .await;
                if swept > 0 {
                    tracing::info!("Swept {} stale media sessions", swept);
                }
                Ok(())
            }
            EngineCommand::NotifyAlarm(alarm) => {
                let body = self.alarms.generate_alarm_notify(&alarm);
                self.send_manscdp(body).await
            }
        }
    }

    /// 心跳 Notify（MANSCDP Keepalive）
    pub async fn send_keepalive(&mut self) -> Result<()> {
        if self.registration != RegistrationState::Registered {
            tracing::debug!("Skipping keepalive while not registered");
            return Ok(());
        }

        self.sn += 1;
        let body = format!(
            "<?xml version=\"1.0\"?>\r\n\
             <Notify>\r\n\
             <CmdType>Keepalive</CmdType>\r\n\
             <SN>{}</SN>\r\n\
             <DeviceID>{}</DeviceID>\r\n\
             <Status>OK</Status>\r\n\
             </Notify>\r\n",
            self.sn, self.config.device_id
        );
        self.send_manscdp(body).await?;
        self.emit(SipEvent::KeepaliveSent);
        Ok(())
    }

    /// 向平台发送 MANSCDP 消息体（MESSAGE 请求）
    async fn send_manscdp(&mut self, body: String) -> Result<()> {
        self.cseq += 1;
        let mut request = SipRequest::new(
            SipMethod::Message,
            format!("sip:{}:{}", self.config.server_ip, self.config.server_port),
        );
        request.add_header("Via", self.via_header());
        request.add_header(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.username, self.config.realm, self.local_tag
            ),
        );
        request.add_header(
            "To",
            format!("<sip:{}:{}>", self.config.server_ip, self.config.server_port),
        );
        request.add_header(
            "Call-ID",
            format!("{:08x}@{}", rand::thread_rng().gen::<u32>(), self.config.realm),
        );
        request.add_header("CSeq", format!("{} MESSAGE", self.cseq));
        request.add_header("Content-Type", "Application/MANSCDP+xml");
        request.add_header("Max-Forwards", "70");
        request.add_header("User-Agent", USER_AGENT);
        request.set_body(body);

        self.send_request(&request).await
    }

    fn build_register(&self, expires: u32, authorization: Option<&str>) -> SipRequest {
        let mut request =
            SipRequest::new(SipMethod::Register, format!("sip:{}", self.config.realm));
        request.add_header("Via", self.via_header());
        request.add_header(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.username, self.config.realm, self.local_tag
            ),
        );
        request.add_header(
            "To",
            format!("<sip:{}@{}>", self.config.username, self.config.realm),
        );
        request.add_header("Call-ID", self.reg_call_id.clone());
        request.add_header("CSeq", format!("{} REGISTER", self.reg_cseq));
        request.add_header("Contact", self.contact_header());
        request.add_header("Max-Forwards", "70");
        request.add_header("Expires", expires.to_string());
        request.add_header("User-Agent", USER_AGENT);
        if let Some(authorization) = authorization {
            request.add_header("Authorization", authorization);
        }
        request
    }

    fn via_header(&self) -> String {
        let local = self.transport.local_addr();
        format!(
            "SIP/2.0/UDP {}:{};rport;branch=z9hG4bK{:08x}",
            local.ip(),
            local.port(),
            rand::thread_rng().gen::<u32>()
        )
    }

    fn contact_header(&self) -> String {
        let local = self.transport.local_addr();
        format!(
            "<sip:{}@{}:{}>",
            self.config.username,
            local.ip(),
            local.port()
        )
    }

    async fn send_request(&self, request: &SipRequest) -> Result<()> {
        self.transport
            .send_to(request.to_string().as_bytes(), self.server_addr)
            .await
    }

    async fn send_response(&self, response: &SipResponse, addr: SocketAddr) -> Result<()> {
        self.transport
            .send_to(response.to_string().as_bytes(), addr)
            .await?;
        tracing::debug!(
            "Sent {} {} to {}",
            response.status_code,
            response.reason_phrase,
            addr
        );
        Ok(())
    }
}

/// 由请求生成响应：仅复制最上面的 Via（平台按 branch 匹配事务）、
/// From/To/Call-ID/CSeq；To 无 tag 时补 tag
fn build_response(request: &SipRequest, status_code: u16, reason: &str) -> SipResponse {
    let mut response = SipResponse::new(status_code, reason.to_string());
    if let Some(via) = request.header("Via") {
        response.add_header("Via", via);
    }
    if let Some(from) = request.header("From") {
        response.add_header("From", from);
    }
    if let Some(to) = request.header("To") {
        if to.contains("tag=") {
            response.add_header("To", to);
        } else {
            response.add_header("To", format!("{};tag={:08x}", to, rand::thread_rng().gen::<u32>()));
        }
    }
    if let Some(call_id) = request.header("Call-ID") {
        response.add_header("Call-ID", call_id);
    }
    if let Some(cseq) = request.header("CSeq") {
        response.add_header("CSeq", cseq);
    }
    response
}

/// 取 SIP URI 的用户部分
fn uri_user(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("sip:").unwrap_or(uri);
    rest.split('@').next().filter(|user| !user.is_empty() && rest.contains('@'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::config::FileConfig;
    use crate::device::info::{ChannelInfo, DeviceInfo, StaticDevice};
    use crate::device::ptz::{HardwarePtzSink, PtzCommand, PtzController};
    use crate::device::record::MemoryRecordStore;
    use crate::sip::auth::digest_response;
    use std::sync::Mutex;
    use tokio::net::UdpSocket;

    const DEVICE_ID: &str = "34020000001320000001";
    const REALM: &str = "3402000000";

    struct NullSink;
    impl HardwarePtzSink for NullSink {
        fn apply(&self, _command: &PtzCommand) -> bool {
            true
        }
    }

    struct CollectingHandler {
        events: Mutex<Vec<SipEvent>>,
    }
    impl SipEventHandler for CollectingHandler {
        fn on_event(&self, event: &SipEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    struct TestBench {
        engine: SipEngine,
        platform: UdpSocket,
        handler: Arc<CollectingHandler>,
    }

    async fn bench() -> TestBench {
        let platform = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let platform_addr = platform.local_addr().unwrap();

        let device = Arc::new(StaticDevice::new(DeviceInfo {
            device_id: DEVICE_ID.to_string(),
            device_name: "GB28181 Camera".to_string(),
            manufacturer: "GBDevice".to_string(),
            model: "IPC-1000".to_string(),
            firmware_version: "1.0.0".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: 5060,
            status: DeviceStatus::Offline,
        }));
        device.add_channel(ChannelInfo {
            channel_id: DEVICE_ID.to_string(),
            name: "Camera 1".to_string(),
            channel_type: 0,
            status: "ON".to_string(),
        });

        let sessions = MediaSessionManager::new(50000);
        let alarms = Arc::new(AlarmManager::new());
        let dispatcher = ManscdpDispatcher::new(
            device.clone(),
            device.clone(),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(FileConfig::new("/nonexistent/gbdevice.conf")),
            Arc::new(PtzController::new(Arc::new(NullSink))),
        );

        let config = SipEngineConfig {
            local_ip: "127.0.0.1".to_string(),
            local_port: 0,
            device_id: DEVICE_ID.to_string(),
            realm: REALM.to_string(),
            server_ip: "127.0.0.1".to_string(),
            server_port: platform_addr.port(),
            username: DEVICE_ID.to_string(),
            password: "12345678".to_string(),
            expires: 3600,
            session_timeout: 300,
        };

        let mut engine = SipEngine::new(config, dispatcher, sessions, alarms, device)
            .await
            .unwrap();
        let handler = Arc::new(CollectingHandler {
            events: Mutex::new(Vec::new()),
        });
        engine.set_event_handler(handler.clone());

        TestBench {
            engine,
            platform,
            handler,
        }
    }

    async fn platform_recv(platform: &UdpSocket) -> (String, SocketAddr) {
        let mut buf = vec![0u8; 8192];
        let (len, addr) = tokio::time::timeout(Duration::from_secs(2), platform.recv_from(&mut buf))
            .await
            .expect("recv timeout")
            .expect("recv");
        (String::from_utf8_lossy(&buf[..len]).to_string(), addr)
    }

    fn header_value<'a>(message: &'a str, name: &str) -> Option<&'a str> {
        message
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with(&format!("{}:", name.to_ascii_lowercase())))
            .and_then(|l| l.split_once(':'))
            .map(|(_, v)| v.trim())
    }

    #[tokio::test]
    async fn test_register_digest_flow() {
        let mut bench = bench().await;
        bench.engine.register().await.unwrap();

        // 第一次 REGISTER 不带凭据
        let (first, device_addr) = platform_recv(&bench.platform).await;
        assert!(first.starts_with("REGISTER sip:3402000000 SIP/2.0"));
        assert!(!first.contains("Authorization"));

        // 401 挑战
        let challenge = format!(
            "SIP/2.0 401 Unauthorized\r\n\
             Via: {}\r\n\
             From: {}\r\n\
             To: {}\r\n\
             Call-ID: {}\r\n\
             CSeq: {}\r\n\
             WWW-Authenticate: Digest realm=\"3402000000\", nonce=\"abc\"\r\n\
             Content-Length: 0\r\n\r\n",
            header_value(&first, "Via").unwrap(),
            header_value(&first, "From").unwrap(),
            header_value(&first, "To").unwrap(),
            header_value(&first, "Call-ID").unwrap(),
            header_value(&first, "CSeq").unwrap(),
        );
        bench
            .platform
            .send_to(challenge.as_bytes(), device_addr)
            .await
            .unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        // 带 Digest 凭据的重发，response 按 RFC 2617 计算
        let (second, _) = platform_recv(&bench.platform).await;
        assert!(second.starts_with("REGISTER"));
        let authorization = header_value(&second, "Authorization").unwrap();
        let expected = digest_response(
            "REGISTER",
            "sip:3402000000",
            DEVICE_ID,
            REALM,
            "12345678",
            "abc",
            None,
            None,
        );
        assert!(authorization.contains(&format!("response=\"{}\"", expected)));
        assert!(header_value(&second, "CSeq").unwrap().starts_with("2 "));

        // 200 OK 后进入已注册态
        let ok = format!(
            "SIP/2.0 200 OK\r\n\
             Via: {}\r\n\
             Call-ID: {}\r\n\
             CSeq: {}\r\n\
             Expires: 3600\r\n\
             Content-Length: 0\r\n\r\n",
            header_value(&second, "Via").unwrap(),
            header_value(&second, "Call-ID").unwrap(),
            header_value(&second, "CSeq").unwrap(),
        );
        bench.platform.send_to(ok.as_bytes(), device_addr).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        assert_eq!(bench.engine.registration_state(), RegistrationState::Registered);
        let events = bench.handler.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, SipEvent::RegisterSuccess)));
    }

    #[tokio::test]
    async fn test_second_challenge_is_auth_failure() {
        let mut bench = bench().await;
        bench.engine.register().await.unwrap();
        let (first, device_addr) = platform_recv(&bench.platform).await;

        let challenge = |cseq: &str| {
            format!(
                "SIP/2.0 401 Unauthorized\r\n\
                 Call-ID: {}\r\n\
                 CSeq: {}\r\n\
                 WWW-Authenticate: Digest realm=\"3402000000\", nonce=\"abc\"\r\n\
                 Content-Length: 0\r\n\r\n",
                header_value(&first, "Call-ID").unwrap(),
                cseq,
            )
        };

        bench
            .platform
            .send_to(challenge("1 REGISTER").as_bytes(), device_addr)
            .await
            .unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();
        let _ = platform_recv(&bench.platform).await;

        bench
            .platform
            .send_to(challenge("2 REGISTER").as_bytes(), device_addr)
            .await
            .unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            bench.engine.registration_state(),
            RegistrationState::NotRegistered
        );
        let events = bench.handler.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, SipEvent::AuthFailed)));
    }

    #[tokio::test]
    async fn test_catalog_message_flow() {
        let mut bench = bench().await;
        let device_addr = bench.engine.local_addr();

        let query = "<?xml version=\"1.0\"?><Query><CmdType>Catalog</CmdType><SN>17</SN><DeviceID>34020000001320000001</DeviceID></Query>";
        let message = format!(
            "MESSAGE sip:{}@{} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKcat\r\n\
             From: <sip:34020000002000000001@{}>;tag=p1\r\n\
             To: <sip:{}@{}>\r\n\
             Call-ID: catalog-1\r\n\
             CSeq: 20 MESSAGE\r\n\
             Content-Type: Application/MANSCDP+xml\r\n\
             Content-Length: {}\r\n\r\n{}",
            DEVICE_ID, REALM, REALM, DEVICE_ID, REALM, query.len(), query
        );
        bench
            .platform
            .send_to(message.as_bytes(), device_addr)
            .await
            .unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        // 先收到 200 OK
        let (ok, _) = platform_recv(&bench.platform).await;
        assert!(ok.starts_with("SIP/2.0 200 OK"));
        assert_eq!(header_value(&ok, "Call-ID"), Some("catalog-1"));

        // 再收到目录应答 MESSAGE，SN 原样带回
        let (response, _) = platform_recv(&bench.platform).await;
        assert!(response.starts_with("MESSAGE"));
        assert!(response.contains("<CmdType>Catalog</CmdType>"));
        assert!(response.contains("<SN>17</SN>"));
        assert!(response.contains("<SumNum>1</SumNum>"));
        assert_eq!(response.matches("<Item>").count(), 1);
        assert!(response.contains("<DeviceID>34020000001320000001</DeviceID>"));
    }

    #[tokio::test]
    async fn test_invite_ack_bye_flow() {
        let mut bench = bench().await;
        let device_addr = bench.engine.local_addr();

        let offer = "v=0\r\n\
                     o=34020000002000000001 0 0 IN IP4 127.0.0.1\r\n\
                     s=Play\r\n\
                     c=IN IP4 127.0.0.1\r\n\
                     t=0 0\r\n\
                     m=video 6000 RTP/AVP 96\r\n\
                     a=rtpmap:96 H264/90000\r\n";
        let invite = format!(
            "INVITE sip:{}@{} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinv\r\n\
             From: <sip:34020000002000000001@{}>;tag=p1\r\n\
             To: <sip:{}@{}>\r\n\
             Call-ID: invite-1\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            DEVICE_ID, REALM, REALM, DEVICE_ID, REALM, offer.len(), offer
        );
        bench
            .platform
            .send_to(invite.as_bytes(), device_addr)
            .await
            .unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (answer, _) = platform_recv(&bench.platform).await;
        assert!(answer.starts_with("SIP/2.0 200 OK"));
        assert!(answer.contains("Content-Type: application/sdp"));
        assert!(answer.contains("a=rtpmap:96 H264/90000"));

        // 偶数端口且不小于基准端口
        let media_line = answer
            .lines()
            .find(|l| l.starts_with("m=video"))
            .expect("video media line");
        let port: u16 = media_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        assert_eq!(port % 2, 0);
        assert!(port >= 50000);

        let session = bench.engine.sessions().get_session("invite-1").await.unwrap();
        assert_eq!(session.state, SessionState::Inviting);
        assert_eq!(session.local_audio_port, session.local_video_port + 2);

        // ACK -> Established
        let ack = format!(
            "ACK sip:{}@{} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKack\r\n\
             Call-ID: invite-1\r\n\
             CSeq: 1 ACK\r\n\
             Content-Length: 0\r\n\r\n",
            DEVICE_ID, REALM
        );
        bench.platform.send_to(ack.as_bytes(), device_addr).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let session = bench.engine.sessions().get_session("invite-1").await.unwrap();
        assert_eq!(session.state, SessionState::Established);

        // BYE -> 会话移除
        let bye = format!(
            "BYE sip:{}@{} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKbye\r\n\
             Call-ID: invite-1\r\n\
             CSeq: 2 BYE\r\n\
             Content-Length: 0\r\n\r\n",
            DEVICE_ID, REALM
        );
        bench.platform.send_to(bye.as_bytes(), device_addr).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (ok, _) = platform_recv(&bench.platform).await;
        assert!(ok.starts_with("SIP/2.0 200 OK"));
        assert!(bench.engine.sessions().get_session("invite-1").await.is_none());

        let events = bench.handler.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, SipEvent::SessionEstablished { call_id } if call_id == "invite-1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, SipEvent::SessionTerminated { call_id } if call_id == "invite-1")));
    }

    #[tokio::test]
    async fn test_invite_with_bad_sdp_is_rejected() {
        let mut bench = bench().await;
        let device_addr = bench.engine.local_addr();

        let invite = format!(
            "INVITE sip:{}@{} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKbad\r\n\
             Call-ID: bad-1\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: 9\r\n\r\nnot sdp!!",
            DEVICE_ID, REALM
        );
        bench.platform.send_to(invite.as_bytes(), device_addr).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (response, _) = platform_recv(&bench.platform).await;
        assert!(response.starts_with("SIP/2.0 400"));
        assert!(bench.engine.sessions().get_session("bad-1").await.is_none());
    }

    #[tokio::test]
    async fn test_options_and_unsupported_method() {
        let mut bench = bench().await;
        let device_addr = bench.engine.local_addr();

        let options = format!(
            "OPTIONS sip:{}@{} SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1:5060\r\nCall-ID: opt-1\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n",
            DEVICE_ID, REALM
        );
        bench.platform.send_to(options.as_bytes(), device_addr).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (response, _) = platform_recv(&bench.platform).await;
        assert!(response.starts_with("SIP/2.0 200 OK"));
        assert!(header_value(&response, "Allow").unwrap().contains("INVITE"));

        let subscribe = format!(
            "SUBSCRIBE sip:{}@{} SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1:5060\r\nCall-ID: sub-1\r\nCSeq: 1 SUBSCRIBE\r\nContent-Length: 0\r\n\r\n",
            DEVICE_ID, REALM
        );
        bench.platform.send_to(subscribe.as_bytes(), device_addr).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (response, _) = platform_recv(&bench.platform).await;
        assert!(response.starts_with("SIP/2.0 405"));
    }

    #[tokio::test]
    async fn test_unparseable_packet_is_dropped() {
        let mut bench = bench().await;
        let device_addr = bench.engine.local_addr();

        bench
            .platform
            .send_to(b"garbage that is not SIP", device_addr)
            .await
            .unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        // 没有任何响应（避免放大攻击）
        let mut buf = [0u8; 64];
        let silent =
            tokio::time::timeout(Duration::from_millis(200), bench.platform.recv_from(&mut buf))
                .await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_keepalive_command() {
        let mut bench = bench().await;

        // 未注册时不发心跳
        bench.engine.send_keepalive().await.unwrap();
        {
            let mut buf = [0u8; 64];
            let silent = tokio::time::timeout(
                Duration::from_millis(200),
                bench.platform.recv_from(&mut buf),
            )
            .await;
            assert!(silent.is_err());
        }

        // 直接置为已注册后经命令队列触发
        bench.engine.registration = RegistrationState::Registered;
        let sender = bench.engine.command_sender();
        sender.send(EngineCommand::SendKeepalive).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (message, _) = platform_recv(&bench.platform).await;
        assert!(message.starts_with("MESSAGE"));
        assert!(message.contains("<CmdType>Keepalive</CmdType>"));
        assert!(message.contains(&format!("<DeviceID>{}</DeviceID>", DEVICE_ID)));
        assert!(message.contains("<Status>OK</Status>"));
        assert!(header_value(&message, "Content-Type")
            .unwrap()
            .contains("MANSCDP"));
    }

    #[tokio::test]
    async fn test_alarm_notify_command() {
        let mut bench = bench().await;
        let mut alarm = AlarmInfo::new(
            DEVICE_ID,
            DEVICE_ID,
            crate::device::alarm::AlarmType::MotionDetect,
            crate::device::alarm::AlarmLevel::Warning,
        );
        alarm.start_time = "2024-06-01T12:00:00".to_string();

        let sender = bench.engine.command_sender();
        sender.send(EngineCommand::NotifyAlarm(alarm)).await.unwrap();
        bench.engine.step(Duration::from_secs(1)).await.unwrap();

        let (message, _) = platform_recv(&bench.platform).await;
        assert!(message.contains("<CmdType>Alarm</CmdType>"));
        assert!(message.contains("<AlarmType>2</AlarmType>"));
        assert!(message.contains("<AlarmLevel>2</AlarmLevel>"));
    }

    #[test]
    fn test_uri_user() {
        assert_eq!(uri_user("sip:34020000001320000001@3402000000"), Some("34020000001320000001"));
        assert_eq!(uri_user("sip:3402000000"), None);
        assert_eq!(uri_user("sip:@host"), None);
    }
}
