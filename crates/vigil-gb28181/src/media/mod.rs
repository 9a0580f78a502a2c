//! 媒体接收：RTP 进、解出 PS、成帧后投给上层流媒体。

pub mod conn;
pub mod server;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use vigil_mpegps::PsStreamType;

use crate::channel::MediaInfo;
use crate::error::Result;

/// 成帧后的访问单元。时间戳毫秒，已按首帧归零。
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub payload_type: AvPayloadType,
    pub pts: u64,
    pub dts: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvPayloadType {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
}

impl AvPayloadType {
    pub fn from_ps(cid: PsStreamType) -> Option<AvPayloadType> {
        match cid {
            PsStreamType::H264 => Some(AvPayloadType::H264),
            PsStreamType::H265 => Some(AvPayloadType::H265),
            PsStreamType::Aac => Some(AvPayloadType::Aac),
            PsStreamType::G711A => Some(AvPayloadType::G711A),
            PsStreamType::G711U => Some(AvPayloadType::G711U),
            PsStreamType::Unknown => None,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, AvPayloadType::H264 | AvPayloadType::H265)
    }
}

/// 收流服务回查信令侧的口子，由 SignalingServer 实现。
#[async_trait]
pub trait MediaObserver: Send + Sync {
    /// 单端口模式：首包按 SSRC 找会话。
    async fn media_by_ssrc(&self, ssrc: u32) -> Option<MediaInfo>;
    /// 多端口模式：按注册键找会话。
    async fn media_by_key(&self, key: &str) -> Option<MediaInfo>;
    /// 收流断开，信令侧负责发 BYE、清会话。
    async fn stream_closed(&self, stream_name: &str);
}

/// 帧的去向，接进自己的流媒体分发层。
#[async_trait]
pub trait IngestSink: Send + Sync {
    async fn open(&self, stream_name: &str) -> Result<Arc<dyn SinkSession>>;
    async fn close(&self, stream_name: &str);
}

#[async_trait]
pub trait SinkSession: Send + Sync {
    async fn write_packet(&self, packet: AvPacket) -> Result<()>;
}

/// 把帧转发到 mpsc 通道的 sink，测试和简单管道场景用。
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<(String, AvPacket)>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(String, AvPacket)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

#[async_trait]
impl IngestSink for ChannelSink {
    async fn open(&self, stream_name: &str) -> Result<Arc<dyn SinkSession>> {
        Ok(Arc::new(ChannelSession { stream_name: stream_name.to_string(), tx: self.tx.clone() }))
    }

    async fn close(&self, _stream_name: &str) {}
}

struct ChannelSession {
    stream_name: String,
    tx: tokio::sync::mpsc::UnboundedSender<(String, AvPacket)>,
}

#[async_trait]
impl SinkSession for ChannelSession {
    async fn write_packet(&self, packet: AvPacket) -> Result<()> {
        self.tx
            .send((self.stream_name.clone(), packet))
            .map_err(|_| crate::error::GbError::Media("sink receiver dropped".to_string()))
    }
}

/// 只打日志的空实现，联调信令时用。
pub struct NullSink;

#[async_trait]
impl IngestSink for NullSink {
    async fn open(&self, stream_name: &str) -> Result<Arc<dyn SinkSession>> {
        debug!(target: "gb28181::media", stream = stream_name, "stream opened");
        Ok(Arc::new(NullSession))
    }

    async fn close(&self, stream_name: &str) {
        debug!(target: "gb28181::media", stream = stream_name, "stream closed");
    }
}

struct NullSession;

#[async_trait]
impl SinkSession for NullSession {
    async fn write_packet(&self, packet: AvPacket) -> Result<()> {
        debug!(
            target: "gb28181::media",
            payload_type = ?packet.payload_type,
            pts = packet.pts,
            len = packet.payload.len(),
            "frame"
        );
        Ok(())
    }
}
