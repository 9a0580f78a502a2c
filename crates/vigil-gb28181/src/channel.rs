//! 通道：设备下挂的摄像头/子目录，点播会话的载体。

use std::sync::atomic::{AtomicU8, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 通道点播状态机：空闲 -> 邀约中 -> 播放中。
pub const INVITE_IDLE: u8 = 0;
pub const INVITE_PENDING: u8 = 1;
pub const INVITE_PLAYING: u8 = 2;

/// 目录里的通道描述，字段名即 MANSCDP 字段名。
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ChannelInfo {
    #[serde(rename = "DeviceID")]
    pub channel_id: String,
    #[serde(rename = "ParentID")]
    pub parent_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub port: u16,
    pub parental: u8,
    pub register_way: u8,
    pub secrecy: u8,
    /// ON/OFF/VLOST/DEFECT，来自目录或 Notify 事件。
    pub status: String,
}

impl ChannelInfo {
    /// 只有明确的 OFF 才算停用：现场不少设备的目录项不带 Status。
    pub fn is_offline(&self) -> bool {
        self.status == "OFF"
    }
}

/// GPS 位置，经纬度保留设备上报的原文。
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GpsInfo {
    pub longitude: String,
    pub latitude: String,
    pub time: String,
}

/// 点播会话期间的媒体上下文。
#[derive(Debug, Default, Clone)]
pub struct MediaInfo {
    pub is_invite: bool,
    pub ssrc: u32,
    pub stream_name: String,
    pub single_port: bool,
    /// 媒体服务注册表键：单端口是 `{transport}{port}`，多端口是 `{deviceId}{channelId}`。
    pub media_key: String,
    pub call_id: String,
    pub transport: String,
}

impl MediaInfo {
    pub fn clear(&mut self) {
        *self = MediaInfo::default();
    }
}

pub struct Channel {
    pub device_id: String,
    pub info: RwLock<ChannelInfo>,
    pub gps: RwLock<GpsInfo>,
    pub media: RwLock<MediaInfo>,
    invite: AtomicU8,
}

impl Channel {
    pub fn new(device_id: &str, info: ChannelInfo) -> Self {
        Channel {
            device_id: device_id.to_string(),
            info: RwLock::new(info),
            gps: RwLock::new(GpsInfo::default()),
            media: RwLock::new(MediaInfo::default()),
            invite: AtomicU8::new(INVITE_IDLE),
        }
    }

    pub fn invite_state(&self) -> u8 {
        self.invite.load(Ordering::Acquire)
    }

    /// 抢占邀约权，同一通道同一时刻只允许一路实时点播。
    pub fn begin_invite(&self) -> bool {
        self.invite
            .compare_exchange(INVITE_IDLE, INVITE_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_playing(&self) {
        self.invite.store(INVITE_PLAYING, Ordering::Release);
    }

    pub fn reset_invite(&self) {
        self.invite.store(INVITE_IDLE, Ordering::Release);
    }

    /// 实时点播的前置条件：空闲、编码合法、没有明确停用且类型码是摄像头（132）。
    pub async fn can_invite(&self) -> bool {
        if self.invite_state() != INVITE_IDLE {
            return false;
        }
        let info = self.info.read().await;
        info.channel_id.len() == 20
            && !info.is_offline()
            && &info.channel_id[10..13] == "132"
    }
}

/// 点播参数。start/end 都为 0 表示实时流。
#[derive(Debug, Clone, Default)]
pub struct InviteOptions {
    pub start: i64,
    pub end: i64,
    pub ssrc: String,
    pub ssrc_num: u32,
    pub media_port: u16,
}

impl InviteOptions {
    pub fn is_live(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn session_name(&self) -> &'static str {
        if self.is_live() {
            "Play"
        } else {
            "Playback"
        }
    }

    /// SSRC 生成规则：实时流 0 开头 + 平台编码 4~8 位 + 4 位随机数，共 10 位。
    pub fn create_ssrc(&mut self, serial: &str) {
        let prefix = if serial.len() >= 8 { &serial[3..8] } else { "00000" };
        let tail: u16 = rand::thread_rng().gen_range(1000..=9999);
        let head = if self.is_live() { '0' } else { '1' };
        self.ssrc = format!("{}{}{}", head, prefix, tail);
        self.ssrc_num = self.ssrc.parse().unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_info() -> ChannelInfo {
        ChannelInfo {
            channel_id: "34020000001320000101".to_string(),
            status: "ON".to_string(),
            ..ChannelInfo::default()
        }
    }

    #[tokio::test]
    async fn invite_guard_is_exclusive() {
        let ch = Channel::new("34020000001320000001", camera_info());
        assert!(ch.can_invite().await);
        assert!(ch.begin_invite());
        assert!(!ch.begin_invite());
        assert!(!ch.can_invite().await);
        ch.set_playing();
        assert_eq!(ch.invite_state(), INVITE_PLAYING);
        ch.reset_invite();
        assert!(ch.begin_invite());
    }

    #[tokio::test]
    async fn offline_or_non_camera_cannot_invite() {
        let mut info = camera_info();
        info.status = "OFF".to_string();
        let ch = Channel::new("34020000001320000001", info);
        assert!(!ch.can_invite().await);

        let mut info = camera_info();
        // 类型码 215 是业务分组，不是摄像头。
        info.channel_id = "34020000002150000101".to_string();
        let ch = Channel::new("34020000001320000001", info);
        assert!(!ch.can_invite().await);
    }

    #[tokio::test]
    async fn missing_status_still_invitable() {
        // 目录项不带 Status 是常态，不能因此拒绝点播。
        let mut info = camera_info();
        info.status = String::new();
        let ch = Channel::new("34020000001320000001", info);
        assert!(ch.can_invite().await);

        let mut info = camera_info();
        info.status = "NoParent".to_string();
        let ch = Channel::new("34020000001320000001", info);
        assert!(ch.can_invite().await);
    }

    #[test]
    fn ssrc_layout() {
        let mut opts = InviteOptions::default();
        opts.create_ssrc("34020000002000000001");
        assert_eq!(opts.ssrc.len(), 10);
        assert!(opts.ssrc.starts_with("020000"));
        // 实时流首位是 0，数值化后少一位。
        assert_eq!(opts.ssrc_num.to_string().len(), 9);
        assert!(opts.is_live());

        let mut playback = InviteOptions { start: 100, end: 200, ..Default::default() };
        playback.create_ssrc("34020000002000000001");
        assert!(playback.ssrc.starts_with('1'));
        assert_eq!(playback.session_name(), "Playback");
    }
}
