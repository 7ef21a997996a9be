// GB28181 SIP 信令层
// 实现国标 GB/T 28181-2016 设备侧的 SIP 信令

pub mod transport;
pub mod message;
pub mod auth;
pub mod sdp;
pub mod session;
pub mod engine;

pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use transport::SipTransport;
pub use auth::{DigestChallenge, digest_response, parse_digest_challenge};
pub use sdp::{AudioCodec, SdpMedia, SdpSession, VideoCodec};
pub use session::{MediaSession, MediaSessionManager, MediaSink, SessionState};
pub use engine::{EngineCommand, RegistrationState, SipEngine, SipEngineConfig, SipEvent, SipEventHandler};
