// SIP UDP 传输层
// 只负责数据报收发，不感知 SIP 结构

use crate::error::{DeviceError, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;

/// SIP over UDP 约定单报文不超过 MTU，超出 4KiB 的报文按解析失败丢弃
const RECV_BUFFER_SIZE: usize = 4096;

pub struct SipTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl SipTransport {
    /// 绑定本地端点
    ///
    /// local_ip 为 "auto" 时探测本机对外 IPv4 地址。
    pub async fn bind(local_ip: &str, local_port: u16) -> Result<Self> {
        let ip: IpAddr = if local_ip.is_empty() || local_ip == "auto" {
            let detected = detect_local_ip().await?;
            tracing::info!("Auto-detected local IP: {}", detected);
            detected
        } else {
            local_ip
                .parse()
                .map_err(|e| DeviceError::Other(format!("Invalid local IP {}: {}", local_ip, e)))?
        };

        let socket = UdpSocket::bind(SocketAddr::new(ip, local_port)).await?;
        let local_addr = socket.local_addr()?;

        tracing::info!("SIP transport bound on {}", local_addr);

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    /// 接收一个数据报，返回内容与来源地址
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        Ok((buf[..len].to_vec(), addr))
    }
}

/// 通过探测路由取本机非回环 IPv4 地址，探测包不会真正发出
async fn detect_local_ip() -> Result<IpAddr> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe
        .connect("8.8.8.8:80")
        .await
        .map_err(|e| DeviceError::Other(format!("Failed to detect local IP: {}", e)))?;
    let addr = probe.local_addr()?;
    if addr.ip().is_loopback() || addr.ip().is_unspecified() {
        return Err(DeviceError::Other(
            "No operational non-loopback interface".to_string(),
        ));
    }
    Ok(addr.ip())
}
