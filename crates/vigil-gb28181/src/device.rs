//! 设备注册表：在线设备、鉴权挑战状态、注册失败计数与巡检。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::channel::{Channel, ChannelInfo, GpsInfo, MediaInfo};
use crate::error::{GbError, Result};
use crate::sip::auth;

/// 同一设备允许的连续注册失败次数，超过即封禁到下一轮清理。
pub const MAX_REGISTER_COUNT: u32 = 3;

/// 目录同步节流窗口，秒。
const SYNC_THROTTLE_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    /// 刚完成注册，目录还没回来。
    Register,
    /// 凭心跳自动恢复的设备。
    Recover,
    Online,
    Offline,
    Alarmed,
}

#[derive(Debug)]
pub struct DeviceState {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub status: DeviceStatus,
    /// 信令来源地址，响应和下行请求都发回这里。
    pub net_addr: SocketAddr,
    pub update_time: DateTime<Utc>,
    pub last_keepalive: DateTime<Utc>,
    pub gps: GpsInfo,
}

pub struct Device {
    pub id: String,
    pub register_time: DateTime<Utc>,
    pub state: RwLock<DeviceState>,
    pub channels: DashMap<String, Arc<Channel>>,
    sn: AtomicU32,
    last_sync: RwLock<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: &str, addr: SocketAddr, status: DeviceStatus) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Device {
            id: id.to_string(),
            register_time: now,
            state: RwLock::new(DeviceState {
                name: String::new(),
                manufacturer: String::new(),
                model: String::new(),
                firmware: String::new(),
                status,
                net_addr: addr,
                update_time: now,
                last_keepalive: now,
                gps: GpsInfo::default(),
            }),
            channels: DashMap::new(),
            sn: AtomicU32::new(0),
            last_sync: RwLock::new(now - Duration::seconds(SYNC_THROTTLE_SECS + 1)),
        })
    }

    /// 下行请求的 CSeq 序号。
    pub fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn mark_keepalive(&self) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.last_keepalive = now;
        state.update_time = now;
    }

    pub async fn touch(&self) {
        self.state.write().await.update_time = Utc::now();
    }

    /// 目录同步节流：窗口内只放行一次。
    pub async fn should_sync_catalog(&self) -> bool {
        let mut last = self.last_sync.write().await;
        let now = Utc::now();
        if now - *last < Duration::seconds(SYNC_THROTTLE_SECS) {
            return false;
        }
        *last = now;
        true
    }

    /// 目录项入库：已有通道只更新描述，保留点播等运行态。
    pub async fn upsert_channel(&self, info: ChannelInfo) -> Arc<Channel> {
        if let Some(ch) = self.channels.get(&info.channel_id).map(|c| c.value().clone()) {
            *ch.info.write().await = info;
            return ch;
        }
        let ch = Arc::new(Channel::new(&self.id, info.clone()));
        self.channels.insert(info.channel_id, ch.clone());
        ch
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels.get(channel_id).map(|c| c.value().clone())
    }

    pub fn remove_channel(&self, channel_id: &str) {
        self.channels.remove(channel_id);
    }

    pub async fn set_channel_status(&self, channel_id: &str, status: &str) {
        if let Some(ch) = self.channel(channel_id) {
            ch.info.write().await.status = status.to_string();
        }
    }

    async fn all_channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|c| c.value().clone()).collect()
    }
}

/// 设备概览，给上层做 JSON 输出用。
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub status: DeviceStatus,
    pub net_addr: String,
    pub channel_count: usize,
    pub register_time: DateTime<Utc>,
    pub last_keepalive: DateTime<Utc>,
}

#[derive(Default)]
pub struct Registry {
    devices: DashMap<String, Arc<Device>>,
    /// 每设备一个在途 nonce，注册成功后清掉。
    nonces: DashMap<String, String>,
    register_counts: DashMap<String, u32>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    /// 注册成功入库；已存在则只刷新来源地址和状态。
    pub async fn store_device(&self, id: &str, addr: SocketAddr) -> Arc<Device> {
        if let Some(dev) = self.device(id) {
            let mut state = dev.state.write().await;
            state.net_addr = addr;
            state.status = DeviceStatus::Register;
            state.update_time = Utc::now();
            drop(state);
            return dev;
        }
        let dev = Device::new(id, addr, DeviceStatus::Register);
        self.devices.insert(id.to_string(), dev.clone());
        info!(target: "gb28181::registry", device = id, %addr, "device registered");
        dev
    }

    /// 凭心跳恢复未注册设备（quick login）。
    pub async fn recover_device(&self, id: &str, addr: SocketAddr) -> Arc<Device> {
        let dev = Device::new(id, addr, DeviceStatus::Recover);
        self.devices.insert(id.to_string(), dev.clone());
        info!(target: "gb28181::registry", device = id, %addr, "device recovered by keepalive");
        dev
    }

    pub fn remove_device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.remove(id).map(|(_, d)| d)
    }

    pub fn find_channel(&self, device_id: &str, channel_id: &str) -> Result<(Arc<Device>, Arc<Channel>)> {
        let dev = self.device(device_id).ok_or_else(|| GbError::DeviceNotFound(device_id.to_string()))?;
        let ch = dev.channel(channel_id).ok_or_else(|| GbError::ChannelNotFound(channel_id.to_string()))?;
        Ok((dev, ch))
    }

    /// 跨设备按通道编码找，MobilePosition 这类只带通道号的通知会用到。
    pub fn find_channel_anywhere(&self, channel_id: &str) -> Option<(Arc<Device>, Arc<Channel>)> {
        for dev in self.all_devices() {
            if let Some(ch) = dev.channel(channel_id) {
                return Some((dev, ch));
            }
        }
        None
    }

    /// 单端口模式下收到首包 RTP，按 SSRC 找归属会话。
    pub async fn check_ssrc(&self, ssrc: u32) -> Option<(Arc<Channel>, MediaInfo)> {
        for dev in self.all_devices() {
            for ch in dev.all_channels().await {
                let media = ch.media.read().await.clone();
                if media.is_invite && media.ssrc == ssrc {
                    return Some((ch, media));
                }
            }
        }
        None
    }

    /// 多端口模式下按媒体注册键找会话。
    pub async fn find_media_by_key(&self, key: &str) -> Option<MediaInfo> {
        for dev in self.all_devices() {
            for ch in dev.all_channels().await {
                let media = ch.media.read().await.clone();
                if media.is_invite && media.media_key == key {
                    return Some(media);
                }
            }
        }
        None
    }

    pub async fn find_channel_by_call_id(&self, call_id: &str) -> Option<Arc<Channel>> {
        for dev in self.all_devices() {
            for ch in dev.all_channels().await {
                if ch.media.read().await.call_id == call_id {
                    return Some(ch);
                }
            }
        }
        None
    }

    pub async fn find_channel_by_stream(&self, stream_name: &str) -> Option<(Arc<Device>, Arc<Channel>)> {
        for dev in self.all_devices() {
            for ch in dev.all_channels().await {
                if ch.media.read().await.stream_name == stream_name {
                    return Some((dev, ch));
                }
            }
        }
        None
    }

    // --- 注册挑战状态 ---

    /// 取设备当前挑战 nonce，没有就发一个新的。
    pub fn nonce_for(&self, id: &str) -> String {
        self.nonces.entry(id.to_string()).or_insert_with(auth::new_nonce).clone()
    }

    pub fn current_nonce(&self, id: &str) -> Option<String> {
        self.nonces.get(id).map(|n| n.clone())
    }

    /// 注册成功：清掉挑战与失败计数。
    pub fn clear_register_state(&self, id: &str) {
        self.nonces.remove(id);
        self.register_counts.remove(id);
    }

    pub fn bump_register_count(&self, id: &str) -> u32 {
        let mut count = self.register_counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn is_banned(&self, id: &str) -> bool {
        self.register_counts.get(id).map(|c| *c > MAX_REGISTER_COUNT).unwrap_or(false)
    }

    /// 定期解封，给打错密码的设备重试机会。
    pub fn clear_banned(&self) {
        self.register_counts.retain(|_, count| *count <= MAX_REGISTER_COUNT);
    }

    // --- 巡检 ---

    /// 按心跳超时摘设备、标离线。返回被剔除的设备编码。
    pub async fn status_sweep(&self, keepalive_secs: u64, heartbeat_secs: u64) -> Vec<String> {
        let now = Utc::now();
        let mut evicted = Vec::new();
        for dev in self.all_devices() {
            let (last_keepalive, update_time, status) = {
                let state = dev.state.read().await;
                (state.last_keepalive, state.update_time, state.status)
            };
            if now - last_keepalive > Duration::seconds(keepalive_secs as i64 * 3) {
                self.devices.remove(&dev.id);
                evicted.push(dev.id.clone());
                info!(target: "gb28181::registry", device = %dev.id, "device evicted, keepalive lost");
                continue;
            }
            if status != DeviceStatus::Offline
                && now - update_time > Duration::seconds(heartbeat_secs as i64 * 3)
            {
                dev.state.write().await.status = DeviceStatus::Offline;
                for ch in dev.all_channels().await {
                    ch.info.write().await.status = "OFF".to_string();
                }
                info!(target: "gb28181::registry", device = %dev.id, "device marked offline");
            }
        }
        evicted
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut out = Vec::new();
        for dev in self.all_devices() {
            let state = dev.state.read().await;
            out.push(DeviceSnapshot {
                id: dev.id.clone(),
                name: state.name.clone(),
                manufacturer: state.manufacturer.clone(),
                model: state.model.clone(),
                status: state.status,
                net_addr: state.net_addr.to_string(),
                channel_count: dev.channels.len(),
                register_time: dev.register_time,
                last_keepalive: state.last_keepalive,
            });
        }
        out
    }

    fn all_devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }
}
