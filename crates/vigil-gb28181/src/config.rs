// GB28181 服务配置
// 字段为空/为零时按国标习惯值兜底，和现场配置文件对齐

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GbConfig {
    /// 信令监听地址。
    pub listen_addr: String,
    /// 对外通告的信令 IP（写进 From/Via/Contact）。
    pub sip_ip: String,
    pub sip_port: u16,
    /// 信令传输层，`udp` 或 `tcp`（目前媒体 INVITE 按此选收流传输层）。
    pub sip_network: String,
    /// 平台国标编码（20 位）。
    pub serial: String,
    /// 平台域（国标编码前 10 位）。
    pub realm: String,
    pub username: String,
    pub password: String,
    /// 设备心跳周期，秒。
    pub keepalive_interval: u64,
    /// 未注册设备的 Keepalive 直接视为注册（有些设备重启后只发心跳）。
    pub quick_login: bool,
    pub media: MediaConfig,
}

impl Default for GbConfig {
    fn default() -> Self {
        GbConfig {
            listen_addr: "0.0.0.0".to_string(),
            sip_ip: "127.0.0.1".to_string(),
            sip_port: 5060,
            sip_network: "udp".to_string(),
            serial: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            username: String::new(),
            password: String::new(),
            keepalive_interval: 60,
            quick_login: false,
            media: MediaConfig::default(),
        }
    }
}

impl GbConfig {
    pub fn requires_auth(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// 收流地址（写进 SDP 的 c= 行）。
    pub media_ip: String,
    /// 单端口模式用这个端口收流；多端口模式从它后面的区间分配。
    pub listen_port: u16,
    /// 多端口模式的端口区间跨度。
    pub multi_port_max_increment: u16,
    /// true 则所有通道共用一个收流端口，按 SSRC 区分。
    pub single_port: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            media_ip: "0.0.0.0".to_string(),
            listen_port: 30000,
            multi_port_max_increment: 3000,
            single_port: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_national_standard_conventions() {
        let conf = GbConfig::default();
        assert_eq!(conf.sip_port, 5060);
        assert_eq!(conf.serial, "34020000002000000001");
        assert_eq!(conf.realm, "3402000000");
        assert_eq!(conf.keepalive_interval, 60);
        assert_eq!(conf.media.listen_port, 30000);
        assert_eq!(conf.media.multi_port_max_increment, 3000);
        assert!(!conf.requires_auth());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let conf: GbConfig =
            serde_json::from_str(r#"{"sip_port": 15060, "password": "123456"}"#).unwrap();
        assert_eq!(conf.sip_port, 15060);
        assert_eq!(conf.realm, "3402000000");
        assert!(conf.requires_auth());
    }
}
