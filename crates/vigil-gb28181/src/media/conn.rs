//! 单条收流连接：SSRC 校验、PS 解复用、帧整形后写入 sink。

use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tracing::{debug, info, warn};
use vigil_mpegps::{Frame, PsDemuxer};

use crate::error::{GbError, Result};
use crate::media::{AvPacket, AvPayloadType, IngestSink, MediaObserver, SinkSession};
use crate::rtp::RtpPacket;

pub struct MediaConn {
    /// 多端口模式的会话注册键；单端口模式为空，首包按 SSRC 查。
    media_key: String,
    single_port: bool,
    observer: Weak<dyn MediaObserver>,
    sink: Arc<dyn IngestSink>,
    session: Option<Arc<dyn SinkSession>>,
    stream_name: String,
    demuxer: PsDemuxer,
    rtp_ts: u32,
    /// PS 里 PTS 恒为 0 的设备计数，超过阈值后改用 RTP 时间戳；-1 表示 PTS 正常。
    zero_pts_count: i32,
    base_ts: Option<u64>,
    video_type: Option<AvPayloadType>,
    video_buf: BytesMut,
    video_pts: u64,
    video_dts: u64,
}

/// 连续多少个零 PTS 帧后放弃 PS 时间戳。
const ZERO_PTS_TOLERANCE: i32 = 10;

impl MediaConn {
    pub fn new(
        media_key: &str,
        single_port: bool,
        observer: Weak<dyn MediaObserver>,
        sink: Arc<dyn IngestSink>,
    ) -> Self {
        MediaConn {
            media_key: media_key.to_string(),
            single_port,
            observer,
            sink,
            session: None,
            stream_name: String::new(),
            demuxer: PsDemuxer::new(),
            rtp_ts: 0,
            zero_pts_count: 0,
            base_ts: None,
            video_type: None,
            video_buf: BytesMut::new(),
            video_pts: 0,
            video_dts: 0,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub async fn handle_rtp(&mut self, pkt: &RtpPacket) -> Result<()> {
        if self.session.is_none() {
            self.attach(pkt.header.ssrc).await?;
        }
        self.rtp_ts = pkt.header.timestamp;
        match self.demuxer.input(&pkt.payload) {
            Ok(()) => {}
            Err(e) if e.is_need_more() => {}
            Err(e) => {
                warn!(
                    target: "gb28181::media",
                    stream = %self.stream_name,
                    error = %e,
                    "ps parse error, resyncing"
                );
            }
        }
        while let Some(frame) = self.demuxer.poll_frame() {
            self.on_frame(frame).await?;
        }
        Ok(())
    }

    /// 首包：回查信令侧确认会话，再向 sink 开流。
    async fn attach(&mut self, ssrc: u32) -> Result<()> {
        let observer = self
            .observer
            .upgrade()
            .ok_or_else(|| GbError::Media("signaling server is gone".to_string()))?;
        let media = if self.single_port {
            observer.media_by_ssrc(ssrc).await.ok_or(GbError::InvalidSsrc(ssrc))?
        } else {
            let media = observer
                .media_by_key(&self.media_key)
                .await
                .ok_or_else(|| GbError::Media(format!("no session for key {}", self.media_key)))?;
            if media.ssrc != 0 && media.ssrc != ssrc {
                // 部分设备不回显 SDP 里的 SSRC，多端口模式按端口信任。
                debug!(
                    target: "gb28181::media",
                    expect = media.ssrc,
                    got = ssrc,
                    "ssrc rewritten by device"
                );
            }
            media
        };
        self.stream_name = media.stream_name;
        self.session = Some(self.sink.open(&self.stream_name).await?);
        info!(target: "gb28181::media", stream = %self.stream_name, ssrc, "media stream attached");
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        let Some(payload_type) = AvPayloadType::from_ps(frame.stream_type) else {
            return Ok(());
        };
        let mut pts = frame.pts;
        let mut dts = frame.dts;
        if pts == 0 {
            if self.zero_pts_count >= 0 {
                self.zero_pts_count += 1;
                if self.zero_pts_count > ZERO_PTS_TOLERANCE {
                    pts = u64::from(self.rtp_ts / 90);
                    dts = pts;
                }
            }
        } else if self.zero_pts_count >= 0 {
            self.zero_pts_count = -1;
        }
        if dts == 0 {
            dts = pts;
        }
        let base = *self.base_ts.get_or_insert(dts);
        let pts = pts.saturating_sub(base);
        let dts = dts.saturating_sub(base);

        if payload_type.is_video() {
            // 同一 DTS 的切片聚成一个访问单元，DTS 变了才下发。
            if !self.video_buf.is_empty() && dts != self.video_dts {
                self.flush_video().await?;
            }
            self.video_type = Some(payload_type);
            self.video_pts = pts;
            self.video_dts = dts;
            self.video_buf.extend_from_slice(&frame.payload);
            Ok(())
        } else {
            self.write(AvPacket { payload_type, pts, dts, payload: frame.payload }).await
        }
    }

    async fn flush_video(&mut self) -> Result<()> {
        if self.video_buf.is_empty() {
            return Ok(());
        }
        let Some(payload_type) = self.video_type else {
            self.video_buf.clear();
            return Ok(());
        };
        let packet = AvPacket {
            payload_type,
            pts: self.video_pts,
            dts: self.video_dts,
            payload: self.video_buf.split().freeze(),
        };
        self.write(packet).await
    }

    async fn write(&mut self, packet: AvPacket) -> Result<()> {
        match &self.session {
            Some(session) => session.write_packet(packet).await,
            None => Ok(()),
        }
    }

    /// 连接断开：吐干解复用缓冲，关流并通知信令侧。
    pub async fn close(&mut self) {
        self.demuxer.flush();
        while let Some(frame) = self.demuxer.poll_frame() {
            if self.on_frame(frame).await.is_err() {
                break;
            }
        }
        let _ = self.flush_video().await;
        if self.session.take().is_some() {
            self.sink.close(&self.stream_name).await;
            if let Some(observer) = self.observer.upgrade() {
                observer.stream_closed(&self.stream_name).await;
            }
            info!(target: "gb28181::media", stream = %self.stream_name, "media stream detached");
        }
    }
}
