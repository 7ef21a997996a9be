// gbdeviced: GB28181 设备代理守护进程
// 装配协议引擎与设备本地能力，驱动事件循环和周期任务

use clap::Parser;
use gbdevice::device::{
    AlarmInfo, AlarmManager, AlarmSink, ChannelInfo, DeviceInfo, DeviceStatus, FileConfig,
    HardwarePtzSink, MemoryRecordStore, PtzCommand, PtzController, StaticDevice,
};
use gbdevice::manscdp::ManscdpDispatcher;
use gbdevice::sip::{
    EngineCommand, MediaSession, MediaSessionManager, MediaSink, SipEngine, SipEngineConfig,
    SipEvent, SipEventHandler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "GB/T 28181 device agent")]
struct Args {
    /// 本地 IP（auto 为自动探测）
    #[arg(default_value = "auto")]
    local_ip: String,

    /// 平台 IP
    #[arg(default_value = "192.168.1.1")]
    server_ip: String,

    #[arg(long, default_value_t = 5060)]
    sip_port: u16,

    #[arg(long, default_value_t = 5060)]
    server_port: u16,

    #[arg(long, default_value = "34020000001320000001")]
    device_id: String,

    #[arg(long, default_value = "3402000000")]
    realm: String,

    /// 注册用户名，缺省同 device_id
    #[arg(long)]
    username: Option<String>,

    #[arg(long, default_value = "12345678")]
    password: String,

    #[arg(long, default_value = "./gbdevice.conf")]
    config: String,

    #[arg(long, default_value_t = 3600)]
    expires: u32,

    #[arg(long, default_value_t = 60)]
    keepalive_interval: u64,

    #[arg(long, default_value_t = 60)]
    alarm_report_interval: u64,

    #[arg(long, default_value_t = 300)]
    session_timeout: i64,

    #[arg(long, default_value_t = 50000)]
    rtp_port_base: u16,
}

/// 硬件云台占位实现：真实设备在这里对接驱动
struct LoggingPtzSink;

impl HardwarePtzSink for LoggingPtzSink {
    fn apply(&self, command: &PtzCommand) -> bool {
        tracing::info!(
            "PTZ apply: {:?} speed={} channel={}",
            command.action,
            command.speed,
            command.channel_id
        );
        true
    }
}

/// 告警回调 -> 引擎命令队列，由引擎发出 Notify
struct AlarmRelay {
    commands: mpsc::Sender<EngineCommand>,
}

impl AlarmSink for AlarmRelay {
    fn on_alarm(&self, alarm: &AlarmInfo) {
        if let Err(e) = self
            .commands
            .try_send(EngineCommand::NotifyAlarm(alarm.clone()))
        {
            tracing::warn!("Alarm notify dropped: {}", e);
        }
    }
}

/// 媒体事件占位实现：真实设备在这里启停推流
struct LoggingMediaSink;

impl MediaSink for LoggingMediaSink {
    fn on_session_established(&self, session: &MediaSession) {
        tracing::info!(
            "Media session established: {} -> {}:{} ({:?}, ssrc={})",
            session.call_id,
            session.remote_ip,
            session.remote_video_port,
            session.video_codec,
            session.video_ssrc
        );
    }

    fn on_session_terminated(&self, call_id: &str) {
        tracing::info!("Media session torn down: {}", call_id);
    }
}

struct EventLogger;

impl SipEventHandler for EventLogger {
    fn on_event(&self, event: &SipEvent) {
        match event {
            SipEvent::RegisterSuccess => tracing::info!("Registered to platform"),
            SipEvent::RegisterFailed(reason) => tracing::error!("Register failed: {}", reason),
            SipEvent::AuthFailed => tracing::error!("Authentication failed, check credentials"),
            SipEvent::RegistrationExpired => tracing::warn!("Registration expired"),
            SipEvent::TelebootRequested => {
                // 平台远程重启：驱动层善后，这里只记录
                tracing::warn!("TeleBoot requested, scheduling reboot")
            }
            other => tracing::debug!("SIP event: {:?}", other),
        }
    }
}

struct Runtime {
    engine: SipEngine,
    alarms: Arc<AlarmManager>,
}

async fn build_runtime(args: &Args) -> gbdevice::Result<Runtime> {
    let config = Arc::new(FileConfig::new(&args.config));
    config.load()?;

    let device_name = config
        .value("basic.name")
        .unwrap_or_else(|| "GB28181 Camera".to_string());
    let manufacturer = config
        .value("basic.manufacturer")
        .unwrap_or_else(|| "GBDevice".to_string());
    let model = config
        .value("basic.model")
        .unwrap_or_else(|| "IPC-1000".to_string());

    let device = Arc::new(StaticDevice::new(DeviceInfo {
        device_id: args.device_id.clone(),
        device_name,
        manufacturer,
        model,
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        ip_address: args.local_ip.clone(),
        port: args.sip_port,
        status: DeviceStatus::Offline,
    }));
    device.add_channel(ChannelInfo {
        channel_id: args.device_id.clone(),
        name: config
            .value("basic.channel_name")
            .unwrap_or_else(|| "Camera 1".to_string()),
        channel_type: 0,
        status: "ON".to_string(),
    });

    let records = Arc::new(MemoryRecordStore::new());
    let ptz = Arc::new(PtzController::new(Arc::new(LoggingPtzSink)));
    let dispatcher = ManscdpDispatcher::new(
        device.clone(),
        device.clone(),
        records,
        config.clone(),
        ptz,
    );

    let sessions = MediaSessionManager::new(args.rtp_port_base);
    sessions.set_sink(Arc::new(LoggingMediaSink));

    let alarms = Arc::new(AlarmManager::new());

    let engine_config = SipEngineConfig {
        local_ip: args.local_ip.clone(),
        local_port: args.sip_port,
        device_id: args.device_id.clone(),
        realm: args.realm.clone(),
        server_ip: args.server_ip.clone(),
        server_port: args.server_port,
        username: args.username.clone().unwrap_or_else(|| args.device_id.clone()),
        password: args.password.clone(),
        expires: args.expires,
        session_timeout: args.session_timeout,
    };

    let mut engine = SipEngine::new(
        engine_config,
        dispatcher,
        sessions,
        alarms.clone(),
        device,
    )
    .await?;
    engine.set_event_handler(Arc::new(EventLogger));

    alarms.set_sink(Arc::new(AlarmRelay {
        commands: engine.command_sender(),
    }));

    Ok(Runtime { engine, alarms })
}

/// 周期任务：保活 / 告警重报 / 会话清扫，统一经命令队列回注事件循环
fn spawn_periodic_tasks(args: &Args, commands: mpsc::Sender<EngineCommand>) {
    let keepalive = commands.clone();
    let keepalive_interval = args.keepalive_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(keepalive_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            if keepalive.send(EngineCommand::SendKeepalive).await.is_err() {
                break;
            }
        }
    });

    let report = commands.clone();
    let report_interval = args.alarm_report_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(report_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            if report.send(EngineCommand::ReportAlarms).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            if commands.send(EngineCommand::SweepSessions).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    tracing::info!(
        "gbdeviced starting: device={} server={}:{}",
        args.device_id,
        args.server_ip,
        args.server_port
    );

    let mut runtime = match build_runtime(&args).await {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Initialization failed: {}", e);
            std::process::exit(-1);
        }
    };

    spawn_periodic_tasks(&args, runtime.engine.command_sender());

    if let Err(e) = runtime.engine.register().await {
        tracing::error!("Initial REGISTER failed: {}", e);
        std::process::exit(-1);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            stepped = runtime.engine.step(Duration::from_millis(500)) => {
                if let Err(e) = stepped {
                    tracing::error!("Engine step error: {}", e);
                }
            }
        }
    }

    runtime.engine.unregister().await.ok();
    tracing::info!("Shutdown complete");
    Ok(())
}
