//! 收流端口池。
//!
//! 多端口模式每路点播占一个端口，游标在区间内轮转；
//! 端口在分配时就绑定好，拿到手即可收流，避免先分配后绑定的竞态。

use std::fmt;
use std::str::FromStr;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{GbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = GbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            other => Err(GbError::Sip(format!("unknown transport: {}", other))),
        }
    }
}

/// 已绑定的收流入口。
pub enum PortListener {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

pub struct PortPool {
    transport: Transport,
    listen_ip: String,
    min: u16,
    max: u16,
    cursor: Mutex<u16>,
}

impl PortPool {
    pub fn new(transport: Transport, listen_ip: &str, min: u16, max: u16) -> Self {
        PortPool {
            transport,
            listen_ip: listen_ip.to_string(),
            min,
            max,
            cursor: Mutex::new(min),
        }
    }

    /// 从游标处往后找一个能绑定的端口；转完一圈还没有就报耗尽。
    pub async fn acquire(&self) -> Result<(PortListener, u16)> {
        let mut cursor = self.cursor.lock().await;
        let span = (self.max - self.min) as u32 + 1;
        for _ in 0..span {
            let port = *cursor;
            *cursor = if port >= self.max { self.min } else { port + 1 };
            match self.bind(port).await {
                Ok(listener) => {
                    debug!(target: "gb28181::port_pool", %port, transport = %self.transport, "port acquired");
                    return Ok((listener, port));
                }
                Err(_) => continue,
            }
        }
        Err(GbError::PortExhausted)
    }

    /// 只探测下一个可用端口号，不保留绑定。
    pub async fn peek(&self) -> Result<u16> {
        let (listener, port) = self.acquire().await?;
        drop(listener);
        Ok(port)
    }

    /// 单端口模式：绑定固定端口。
    pub async fn bind_port(&self, port: u16) -> Result<PortListener> {
        self.bind(port).await
    }

    async fn bind(&self, port: u16) -> Result<PortListener> {
        let addr = format!("{}:{}", self.listen_ip, port);
        match self.transport {
            Transport::Udp => Ok(PortListener::Udp(UdpSocket::bind(&addr).await?)),
            Transport::Tcp => Ok(PortListener::Tcp(TcpListener::bind(&addr).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_rotates_cursor() {
        let pool = PortPool::new(Transport::Udp, "127.0.0.1", 31000, 31003);
        let (l1, p1) = pool.acquire().await.unwrap();
        let (_l2, p2) = pool.acquire().await.unwrap();
        assert_eq!(p1, 31000);
        assert_eq!(p2, 31001);
        drop(l1);
        // 游标继续前进，不会立刻复用刚释放的端口。
        let (_l3, p3) = pool.acquire().await.unwrap();
        assert_eq!(p3, 31002);
    }

    #[tokio::test]
    async fn exhausted_range_reports_error() {
        let pool = PortPool::new(Transport::Tcp, "127.0.0.1", 31100, 31101);
        let (_l1, _) = pool.acquire().await.unwrap();
        let (_l2, _) = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(GbError::PortExhausted)));
    }

    #[tokio::test]
    async fn wraps_around_to_released_port() {
        let pool = PortPool::new(Transport::Udp, "127.0.0.1", 31200, 31201);
        let (l1, p1) = pool.acquire().await.unwrap();
        let (_l2, _p2) = pool.acquire().await.unwrap();
        drop(l1);
        let (_l3, p3) = pool.acquire().await.unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn transport_round_trip() {
        assert_eq!("UDP".parse::<Transport>().unwrap(), Transport::Udp);
        assert_eq!(Transport::Tcp.to_string(), "tcp");
        assert!("sctp".parse::<Transport>().is_err());
    }
}
