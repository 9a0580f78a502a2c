//! GB28181 信令网关。
//!
//! 承担国标设备接入的三块事情：
//! - SIP 派生信令：REGISTER（Digest 鉴权）、MESSAGE/NOTIFY（MANSCDP 指令）、
//!   INVITE/ACK/BYE（点播会话）；
//! - 设备与通道注册表：心跳、目录同步、GPS、状态巡检；
//! - 媒体接收：按端口起 RTP 收流服务，PS 解复用后投给 [`media::IngestSink`]。
//!
//! 典型用法：实现 `IngestSink` 把帧接进自己的流媒体层，然后
//! `SignalingServer::bind(conf, sink)` + `start()`。

pub mod channel;
pub mod config;
pub mod device;
mod error;
pub mod media;
pub mod port_pool;
pub mod rtp;
pub mod sip;
pub mod xml;

pub use channel::{Channel, ChannelInfo, InviteOptions, MediaInfo};
pub use config::{GbConfig, MediaConfig};
pub use device::{Device, DeviceStatus, Registry};
pub use error::{GbError, Result};
pub use sip::server::SignalingServer;
