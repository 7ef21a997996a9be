// SDP 解析与应答生成
// 设备侧：解析平台 INVITE 携带的 offer，按编码偏好生成 answer

use crate::error::{DeviceError, Result};
use std::fmt;

/// 视频编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Ps,
}

impl VideoCodec {
    /// 协商偏好顺序
    pub const PREFERENCE: [VideoCodec; 3] = [VideoCodec::H264, VideoCodec::H265, VideoCodec::Ps];

    pub fn token(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::Ps => "PS",
        }
    }

    pub fn default_payload_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 96,
            VideoCodec::H265 => 98,
            VideoCodec::Ps => 99,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("H264") {
            Some(VideoCodec::H264)
        } else if token.eq_ignore_ascii_case("H265") {
            Some(VideoCodec::H265)
        } else if token.eq_ignore_ascii_case("PS") {
            Some(VideoCodec::Ps)
        } else {
            None
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// 音频编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Pcma,
    Pcmu,
    Aac,
}

impl AudioCodec {
    pub const PREFERENCE: [AudioCodec; 3] = [AudioCodec::Pcma, AudioCodec::Pcmu, AudioCodec::Aac];

    pub fn token(&self) -> &'static str {
        match self {
            AudioCodec::Pcma => "PCMA",
            AudioCodec::Pcmu => "PCMU",
            AudioCodec::Aac => "AAC",
        }
    }

    pub fn default_payload_type(&self) -> u8 {
        match self {
            AudioCodec::Pcmu => 0,
            AudioCodec::Pcma => 8,
            AudioCodec::Aac => 97,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("PCMA") {
            Some(AudioCodec::Pcma)
        } else if token.eq_ignore_ascii_case("PCMU") {
            Some(AudioCodec::Pcmu)
        } else if token.eq_ignore_ascii_case("AAC") {
            Some(AudioCodec::Aac)
        } else {
            None
        }
    }

    /// 静态负载类型映射（offer 未携带 rtpmap 时）
    fn from_static_payload(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(AudioCodec::Pcmu),
            8 => Some(AudioCodec::Pcma),
            _ => None,
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// RTP 负载映射
#[derive(Debug, Clone)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// SDP 媒体描述
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    pub rtpmap: Vec<RtpMap>,
    pub attributes: Vec<String>,
    /// 媒体级 c= 地址（覆盖会话级）
    pub connection: Option<String>,
}

/// SDP 会话描述
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u8,
    pub session_id: String,
    pub session_name: String,
    pub connection: Option<String>,
    /// GB28181 的 y= 行携带 SSRC
    pub ssrc: Option<u32>,
    pub media: Vec<SdpMedia>,
}

impl SdpSession {
    /// 逐行解析 SDP，c=/a= 归属到当前 m= 段
    pub fn from_string(sdp: &str) -> Result<Self> {
        let mut session = SdpSession {
            version: 0,
            session_id: String::new(),
            session_name: String::new(),
            connection: None,
            ssrc: None,
            media: Vec::new(),
        };

        let mut current_media: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "v" => {
                    session.version = value.parse().unwrap_or(0);
                }
                "o" => {
                    if let Some(first) = value.split_whitespace().next() {
                        session.session_id = first.to_string();
                    }
                }
                "s" => {
                    session.session_name = value.to_string();
                }
                "c" => {
                    let addr = value
                        .split_whitespace()
                        .nth(2)
                        .map(|a| a.to_string());
                    match current_media.as_mut() {
                        Some(media) => media.connection = addr,
                        None => session.connection = addr,
                    }
                }
                "y" => {
                    if let Ok(v) = value.trim().parse::<u32>() {
                        session.ssrc = Some(v);
                    }
                }
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 4 {
                        return Err(DeviceError::MalformedSdp(line.to_string()));
                    }
                    let port = parts[1]
                        .parse()
                        .map_err(|_| DeviceError::MalformedSdp(line.to_string()))?;
                    let formats = parts[3..]
                        .iter()
                        .filter_map(|s| s.parse().ok())
                        .collect();
                    current_media = Some(SdpMedia {
                        media_type: parts[0].to_string(),
                        port,
                        protocol: parts[2].to_string(),
                        formats,
                        rtpmap: Vec::new(),
                        attributes: Vec::new(),
                        connection: None,
                    });
                }
                "a" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap_str) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, rest)) = rtpmap_str.split_once(' ') {
                                let payload_type = pt.parse().unwrap_or(0);
                                let mut encoding = rest.split('/');
                                let encoding_name =
                                    encoding.next().unwrap_or("").to_string();
                                let clock_rate = encoding
                                    .next()
                                    .and_then(|c| c.parse().ok())
                                    .unwrap_or(90000);
                                media.rtpmap.push(RtpMap {
                                    payload_type,
                                    encoding_name,
                                    clock_rate,
                                });
                            }
                        } else {
                            media.attributes.push(value.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }

        Ok(session)
    }

    fn media_section(&self, media_type: &str) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == media_type)
    }
}

/// offer 协商结果：远端地址/端口 + 选定编码及其负载类型
#[derive(Debug, Clone)]
pub struct NegotiatedOffer {
    pub remote_ip: String,
    pub video_port: u16,
    pub video_codec: VideoCodec,
    pub video_payload: u8,
    pub audio: Option<NegotiatedAudio>,
}

#[derive(Debug, Clone)]
pub struct NegotiatedAudio {
    pub port: u16,
    pub codec: AudioCodec,
    pub payload: u8,
}

/// 按偏好协商 offer
///
/// 视频偏好 H264 > H265 > PS，音频偏好 PCMA > PCMU > AAC，
/// 取 offer 中出现的第一个匹配项；应答负载类型沿用 offer 声明的值。
pub fn negotiate_offer(sdp: &SdpSession) -> Result<NegotiatedOffer> {
    let video = sdp
        .media_section("video")
        .ok_or_else(|| DeviceError::MalformedSdp("no video media section".to_string()))?;

    let remote_ip = video
        .connection
        .clone()
        .or_else(|| sdp.connection.clone())
        .ok_or_else(|| DeviceError::MalformedSdp("no connection address".to_string()))?;

    let (video_codec, video_payload) = VideoCodec::PREFERENCE
        .iter()
        .find_map(|codec| {
            video
                .rtpmap
                .iter()
                .find(|m| VideoCodec::from_token(&m.encoding_name) == Some(*codec))
                .map(|m| (*codec, m.payload_type))
        })
        .ok_or_else(|| DeviceError::MalformedSdp("no supported video codec".to_string()))?;

    let audio = sdp.media_section("audio").and_then(|media| {
        AudioCodec::PREFERENCE.iter().find_map(|codec| {
            // rtpmap 优先；无 rtpmap 时按静态负载类型识别
            let by_rtpmap = media
                .rtpmap
                .iter()
                .find(|m| AudioCodec::from_token(&m.encoding_name) == Some(*codec))
                .map(|m| m.payload_type);
            let payload = by_rtpmap.or_else(|| {
                media
                    .formats
                    .iter()
                    .copied()
                    .find(|pt| AudioCodec::from_static_payload(*pt) == Some(*codec))
            })?;
            Some(NegotiatedAudio {
                port: media.port,
                codec: *codec,
                payload,
            })
        })
    });

    Ok(NegotiatedOffer {
        remote_ip,
        video_port: video.port,
        video_codec,
        video_payload,
        audio,
    })
}

/// 生成 SDP answer
///
/// 单会话单地址，视频 + 可选音频各一个 m= 段；H264 附带 fmtp。
pub fn build_answer(
    local_ip: &str,
    session_id: &str,
    video_port: u16,
    audio_port: u16,
    offer: &NegotiatedOffer,
) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- {} 1 IN IP4 {}\r\n", session_id, local_ip));
    sdp.push_str("s=Play\r\n");
    sdp.push_str(&format!("c=IN IP4 {}\r\n", local_ip));
    sdp.push_str("t=0 0\r\n");

    sdp.push_str(&format!(
        "m=video {} RTP/AVP {}\r\n",
        video_port, offer.video_payload
    ));
    sdp.push_str(&format!(
        "a=rtpmap:{} {}/90000\r\n",
        offer.video_payload,
        offer.video_codec.token()
    ));
    if offer.video_codec == VideoCodec::H264 {
        sdp.push_str(&format!(
            "a=fmtp:{} profile-level-id=42e01f;packetization-mode=1\r\n",
            offer.video_payload
        ));
    }

    if let Some(audio) = &offer.audio {
        sdp.push_str(&format!("m=audio {} RTP/AVP {}\r\n", audio_port, audio.payload));
        sdp.push_str(&format!(
            "a=rtpmap:{} {}/8000/1\r\n",
            audio.payload,
            audio.codec.token()
        ));
    }

    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
                         o=34020000002000000001 0 0 IN IP4 192.168.1.1\r\n\
                         s=Play\r\n\
                         c=IN IP4 192.168.1.1\r\n\
                         t=0 0\r\n\
                         m=video 6000 RTP/AVP 96 98\r\n\
                         a=rtpmap:96 H264/90000\r\n\
                         a=rtpmap:98 H265/90000\r\n\
                         a=recvonly\r\n\
                         m=audio 6002 RTP/AVP 8 0\r\n\
                         a=rtpmap:8 PCMA/8000\r\n\
                         a=rtpmap:0 PCMU/8000\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = SdpSession::from_string(OFFER).unwrap();
        assert_eq!(sdp.version, 0);
        assert_eq!(sdp.session_id, "34020000002000000001");
        assert_eq!(sdp.connection.as_deref(), Some("192.168.1.1"));
        assert_eq!(sdp.media.len(), 2);
        assert_eq!(sdp.media[0].port, 6000);
        assert_eq!(sdp.media[0].rtpmap.len(), 2);
        assert_eq!(sdp.media[1].media_type, "audio");
    }

    #[test]
    fn test_parse_ssrc_line() {
        let sdp = SdpSession::from_string(
            "v=0\r\nc=IN IP4 1.2.3.4\r\ny=0000001234\r\nm=video 6000 RTP/AVP 96\r\na=rtpmap:96 PS/90000\r\n",
        )
        .unwrap();
        assert_eq!(sdp.ssrc, Some(1234));
    }

    #[test]
    fn test_negotiate_prefers_h264() {
        let sdp = SdpSession::from_string(OFFER).unwrap();
        let offer = negotiate_offer(&sdp).unwrap();
        assert_eq!(offer.remote_ip, "192.168.1.1");
        assert_eq!(offer.video_port, 6000);
        assert_eq!(offer.video_codec, VideoCodec::H264);
        assert_eq!(offer.video_payload, 96);

        let audio = offer.audio.unwrap();
        assert_eq!(audio.codec, AudioCodec::Pcma);
        assert_eq!(audio.payload, 8);
        assert_eq!(audio.port, 6002);
    }

    #[test]
    fn test_negotiate_falls_back_to_ps() {
        let sdp = SdpSession::from_string(
            "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 15060 RTP/AVP 99\r\na=rtpmap:99 PS/90000\r\n",
        )
        .unwrap();
        let offer = negotiate_offer(&sdp).unwrap();
        assert_eq!(offer.video_codec, VideoCodec::Ps);
        assert_eq!(offer.video_payload, 99);
        assert!(offer.audio.is_none());
    }

    #[test]
    fn test_negotiate_static_audio_payload() {
        // 无 rtpmap 时按静态负载类型识别音频编码
        let sdp = SdpSession::from_string(
            "v=0\r\nc=IN IP4 10.0.0.1\r\n\
             m=video 6000 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n\
             m=audio 6002 RTP/AVP 8\r\n",
        )
        .unwrap();
        let audio = negotiate_offer(&sdp).unwrap().audio.unwrap();
        assert_eq!(audio.codec, AudioCodec::Pcma);
        assert_eq!(audio.payload, 8);
    }

    #[test]
    fn test_negotiate_media_level_connection() {
        let sdp = SdpSession::from_string(
            "v=0\r\nm=video 6000 RTP/AVP 96\r\nc=IN IP4 10.9.8.7\r\na=rtpmap:96 H264/90000\r\n",
        )
        .unwrap();
        assert_eq!(negotiate_offer(&sdp).unwrap().remote_ip, "10.9.8.7");
    }

    #[test]
    fn test_negotiate_rejects_unknown_codec() {
        let sdp = SdpSession::from_string(
            "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 6000 RTP/AVP 100\r\na=rtpmap:100 VP8/90000\r\n",
        )
        .unwrap();
        assert!(negotiate_offer(&sdp).is_err());
    }

    #[test]
    fn test_answer_payload_appeared_in_offer() {
        // offer 使用非常规负载类型编号时，应答沿用 offer 的编号
        let sdp = SdpSession::from_string(
            "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 6000 RTP/AVP 102\r\na=rtpmap:102 H264/90000\r\n",
        )
        .unwrap();
        let offer = negotiate_offer(&sdp).unwrap();
        assert_eq!(offer.video_payload, 102);

        let answer = build_answer("192.168.1.100", "1234", 50000, 50002, &offer);
        assert!(answer.contains("m=video 50000 RTP/AVP 102\r\n"));
        assert!(answer.contains("a=rtpmap:102 H264/90000\r\n"));
    }

    #[test]
    fn test_answer_format() {
        let sdp = SdpSession::from_string(OFFER).unwrap();
        let offer = negotiate_offer(&sdp).unwrap();
        let answer = build_answer("192.168.1.100", "20240101", 50000, 50002, &offer);

        assert!(answer.starts_with("v=0\r\n"));
        assert!(answer.contains("o=- 20240101 1 IN IP4 192.168.1.100\r\n"));
        assert!(answer.contains("s=Play\r\n"));
        assert!(answer.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(answer.contains("t=0 0\r\n"));
        assert!(answer.contains("m=video 50000 RTP/AVP 96\r\n"));
        assert!(answer.contains("a=fmtp:96 profile-level-id=42e01f;packetization-mode=1\r\n"));
        assert!(answer.contains("m=audio 50002 RTP/AVP 8\r\n"));
        assert!(answer.contains("a=rtpmap:8 PCMA/8000/1\r\n"));
    }
}
