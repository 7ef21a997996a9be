// 媒体会话管理
// 会话以 Call-ID 为键；端口/SSRC 分配与状态机推进都在这里收口

use crate::error::{DeviceError, Result};
use crate::sip::sdp::{AudioCodec, VideoCodec};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// RTP 端口上界，保证 audio = video + 2 不越界
const PORT_CEILING: u16 = 65530;

/// 媒体会话状态，只允许沿 DAG 前向推进
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Inviting,
    Established,
    Terminating,
    Terminated,
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Inviting => 1,
            SessionState::Established => 2,
            SessionState::Terminating => 3,
            SessionState::Terminated => 4,
        }
    }

    pub fn can_transition(&self, next: SessionState) -> bool {
        next.rank() > self.rank()
    }
}

/// 媒体会话快照
///
/// 管理器只对外克隆快照，不泄露表内引用。
#[derive(Debug, Clone)]
pub struct MediaSession {
    pub call_id: String,
    pub channel_id: String,
    pub remote_ip: String,
    pub remote_video_port: u16,
    pub remote_audio_port: u16,
    pub local_video_port: u16,
    pub local_audio_port: u16,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub video_ssrc: u32,
    pub audio_ssrc: u32,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl MediaSession {
    fn is_timeout(&self, timeout_secs: i64) -> bool {
        Utc::now()
            .signed_duration_since(self.last_activity)
            .num_seconds()
            > timeout_secs
    }
}

/// 媒体会话事件接口
pub trait MediaSink: Send + Sync {
    fn on_session_established(&self, session: &MediaSession);
    fn on_session_terminated(&self, call_id: &str);
}

/// 媒体会话管理器
#[derive(Clone)]
pub struct MediaSessionManager {
    sessions: Arc<RwLock<HashMap<String, MediaSession>>>,
    next_port: Arc<Mutex<u16>>,
    port_base: u16,
    sink: Arc<std::sync::Mutex<Option<Arc<dyn MediaSink>>>>,
}

impl MediaSessionManager {
    pub fn new(port_base: u16) -> Self {
        // 视频端口必须为偶数且留出 audio = video + 2 的余量
        let port_base = port_base
            .saturating_add(port_base % 2)
            .min(PORT_CEILING);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_port: Arc::new(Mutex::new(port_base)),
            port_base,
            sink: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn MediaSink>) {
        *self.sink.lock().expect("media sink poisoned") = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn MediaSink>> {
        self.sink.lock().expect("media sink poisoned").clone()
    }

    /// 创建会话，初始状态 Inviting，SSRC 随机非零且不与现存会话冲突
    pub async fn create_session(
        &self,
        call_id: &str,
        channel_id: &str,
        remote_ip: &str,
        video_codec: VideoCodec,
        audio_codec: AudioCodec,
    ) -> Result<MediaSession> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(call_id) {
            return Err(DeviceError::SessionAlreadyExists(call_id.to_string()));
        }

        let video_ssrc = generate_ssrc(&sessions);
        let audio_ssrc = loop {
            let candidate = generate_ssrc(&sessions);
            if candidate != video_ssrc {
                break candidate;
            }
        };

        let now = Utc::now();
        let session = MediaSession {
            call_id: call_id.to_string(),
            channel_id: channel_id.to_string(),
            remote_ip: remote_ip.to_string(),
            remote_video_port: 0,
            remote_audio_port: 0,
            local_video_port: 0,
            local_audio_port: 0,
            video_codec,
            audio_codec,
            video_ssrc,
            audio_ssrc,
            state: SessionState::Inviting,
            created_at: now,
            last_activity: now,
        };
        sessions.insert(call_id.to_string(), session.clone());

        tracing::info!(
            "Media session created: {} channel={} remote={}",
            call_id,
            channel_id,
            remote_ip
        );

        Ok(session)
    }

    /// 分配本地端口对：偶数视频端口，音频端口 = 视频端口 + 2
    ///
    /// 从基准端口起每会话步进 4，回绕时跳过仍被占用的槽位。
    pub async fn allocate_local_ports(&self, call_id: &str) -> Result<(u16, u16)> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(call_id) {
            return Err(DeviceError::SessionNotFound(call_id.to_string()));
        }

        let in_use: Vec<u16> = sessions
            .values()
            .filter(|s| s.local_video_port != 0 && s.state != SessionState::Terminated)
            .map(|s| s.local_video_port)
            .collect();

        let mut next_port = self.next_port.lock().await;
        let span = ((PORT_CEILING - self.port_base) / 4 + 1) as u32;
        let mut candidate = *next_port;
        let mut found = None;
        for _ in 0..span {
            if !in_use.contains(&candidate) {
                found = Some(candidate);
                break;
            }
            candidate = if candidate + 4 > PORT_CEILING {
                self.port_base
            } else {
                candidate + 4
            };
        }

        let video_port = found.ok_or(DeviceError::PortExhausted)?;
        *next_port = if video_port + 4 > PORT_CEILING {
            self.port_base
        } else {
            video_port + 4
        };
        drop(next_port);

        let audio_port = video_port + 2;
        let session = sessions
            .get_mut(call_id)
            .ok_or_else(|| DeviceError::SessionNotFound(call_id.to_string()))?;
        session.local_video_port = video_port;
        session.local_audio_port = audio_port;
        session.last_activity = Utc::now();

        Ok((video_port, audio_port))
    }

    pub async fn set_remote_ports(
        &self,
        call_id: &str,
        video_port: u16,
        audio_port: u16,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(call_id)
            .ok_or_else(|| DeviceError::SessionNotFound(call_id.to_string()))?;
        session.remote_video_port = video_port;
        session.remote_audio_port = audio_port;
        session.last_activity = Utc::now();
        Ok(())
    }

    /// 推进会话状态，非前向迁移被拒绝
    pub async fn update_state(&self, call_id: &str, state: SessionState) -> Result<()> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(call_id)
                .ok_or_else(|| DeviceError::SessionNotFound(call_id.to_string()))?;
            if !session.state.can_transition(state) {
                return Err(DeviceError::InvalidStateTransition {
                    from: format!("{:?}", session.state),
                    to: format!("{:?}", state),
                });
            }
            session.state = state;
            session.last_activity = Utc::now();
            tracing::debug!("Session {} -> {:?}", call_id, state);
            session.clone()
        };

        if state == SessionState::Established {
            if let Some(sink) = self.sink() {
                sink.on_session_established(&snapshot);
            }
        }
        Ok(())
    }

    pub async fn update_activity(&self, call_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(call_id)
            .ok_or_else(|| DeviceError::SessionNotFound(call_id.to_string()))?;
        session.last_activity = Utc::now();
        Ok(())
    }

    /// 终止会话并移出映射表，返回终态快照
    pub async fn terminate_session(&self, call_id: &str) -> Result<MediaSession> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let mut session = sessions
                .remove(call_id)
                .ok_or_else(|| DeviceError::SessionNotFound(call_id.to_string()))?;
            session.state = SessionState::Terminated;
            session
        };

        tracing::info!("Media session terminated: {}", call_id);
        if let Some(sink) = self.sink() {
            sink.on_session_terminated(call_id);
        }
        Ok(session)
    }

    pub async fn get_session(&self, call_id: &str) -> Option<MediaSession> {
        self.sessions.read().await.get(call_id).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<MediaSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state == SessionState::Established)
            .cloned()
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 清理超时会话，返回清理数量
    pub async fn cleanup_timeout(&self, timeout_secs: i64) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.is_timeout(timeout_secs))
                .map(|s| s.call_id.clone())
                .collect()
        };

        let mut count = 0;
        for call_id in stale {
            if self.terminate_session(&call_id).await.is_ok() {
                tracing::info!("Session timed out and removed: {}", call_id);
                count += 1;
            }
        }
        count
    }
}

/// 随机生成非零 SSRC，避开现存会话占用的值
fn generate_ssrc(sessions: &HashMap<String, MediaSession>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u32 = rng.gen();
        if candidate == 0 {
            continue;
        }
        let collision = sessions
            .values()
            .any(|s| s.video_ssrc == candidate || s.audio_ssrc == candidate);
        if !collision {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CALL_ID: &str = "test-call-id-123";
    const CHANNEL: &str = "34020000001320000001";

    fn manager() -> MediaSessionManager {
        MediaSessionManager::new(50000)
    }

    async fn create(manager: &MediaSessionManager, call_id: &str) -> MediaSession {
        manager
            .create_session(call_id, CHANNEL, "192.168.1.1", VideoCodec::H264, AudioCodec::Pcma)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_session() {
        let manager = manager();
        let session = create(&manager, CALL_ID).await;

        assert_eq!(session.call_id, CALL_ID);
        assert_eq!(session.state, SessionState::Inviting);
        assert_ne!(session.video_ssrc, 0);
        assert_ne!(session.audio_ssrc, 0);
        assert_ne!(session.video_ssrc, session.audio_ssrc);
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let manager = manager();
        create(&manager, CALL_ID).await;

        let dup = manager
            .create_session(CALL_ID, CHANNEL, "192.168.1.1", VideoCodec::H264, AudioCodec::Pcma)
            .await;
        assert!(matches!(dup, Err(DeviceError::SessionAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_port_allocation_invariants() {
        let manager = manager();
        for i in 0..4 {
            let call_id = format!("call-{}", i);
            create(&manager, &call_id).await;
            let (video, audio) = manager.allocate_local_ports(&call_id).await.unwrap();

            assert_eq!(video % 2, 0);
            assert_eq!(audio, video + 2);
            assert!(video >= 50000);
            assert_eq!(video, 50000 + 4 * i as u16);
        }
    }

    #[tokio::test]
    async fn test_port_reuse_after_terminate() {
        let manager = manager();
        create(&manager, "call-a").await;
        let (first, _) = manager.allocate_local_ports("call-a").await.unwrap();
        manager.terminate_session("call-a").await.unwrap();

        // 计数器继续前进，但回绕后可复用已终止会话的端口
        create(&manager, "call-b").await;
        let (second, _) = manager.allocate_local_ports("call-b").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second, first + 4);
    }

    #[tokio::test]
    async fn test_state_monotonic() {
        let manager = manager();
        create(&manager, CALL_ID).await;

        manager
            .update_state(CALL_ID, SessionState::Established)
            .await
            .unwrap();

        // 回退被拒绝
        let back = manager.update_state(CALL_ID, SessionState::Inviting).await;
        assert!(matches!(
            back,
            Err(DeviceError::InvalidStateTransition { .. })
        ));

        manager
            .update_state(CALL_ID, SessionState::Terminating)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminated_session_is_gone() {
        let manager = manager();
        create(&manager, CALL_ID).await;

        let terminated = manager.terminate_session(CALL_ID).await.unwrap();
        assert_eq!(terminated.state, SessionState::Terminated);

        assert!(manager.get_session(CALL_ID).await.is_none());
        assert!(matches!(
            manager.update_activity(CALL_ID).await,
            Err(DeviceError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.terminate_session(CALL_ID).await,
            Err(DeviceError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_sweep() {
        struct CountingSink {
            terminated: AtomicUsize,
        }
        impl MediaSink for CountingSink {
            fn on_session_established(&self, _session: &MediaSession) {}
            fn on_session_terminated(&self, _call_id: &str) {
                self.terminated.fetch_add(1, Ordering::SeqCst);
            }
        }

        let manager = manager();
        let sink = Arc::new(CountingSink {
            terminated: AtomicUsize::new(0),
        });
        manager.set_sink(sink.clone());

        create(&manager, CALL_ID).await;

        // 模拟 301 秒无活动
        {
            let mut sessions = manager.sessions.write().await;
            let session = sessions.get_mut(CALL_ID).unwrap();
            session.last_activity = Utc::now() - chrono::Duration::seconds(301);
        }

        let count = manager.cleanup_timeout(300).await;
        assert_eq!(count, 1);
        assert!(manager.get_session(CALL_ID).await.is_none());
        assert_eq!(sink.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_established_event() {
        struct EstablishedSink {
            established: AtomicUsize,
        }
        impl MediaSink for EstablishedSink {
            fn on_session_established(&self, session: &MediaSession) {
                assert_eq!(session.state, SessionState::Established);
                self.established.fetch_add(1, Ordering::SeqCst);
            }
            fn on_session_terminated(&self, _call_id: &str) {}
        }

        let manager = manager();
        let sink = Arc::new(EstablishedSink {
            established: AtomicUsize::new(0),
        });
        manager.set_sink(sink.clone());

        create(&manager, CALL_ID).await;
        manager
            .update_state(CALL_ID, SessionState::Established)
            .await
            .unwrap();
        assert_eq!(sink.established.load(Ordering::SeqCst), 1);
    }
}
