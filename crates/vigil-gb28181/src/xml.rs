//! MANSCDP 指令报文（Application/MANSCDP+xml）。
//!
//! 入向统一解析成 [`ManscdpMessage`]，根元素是 Query/Response/Notify 都行，
//! 按 CmdType 分发。老设备声明 GB2312 编码，UTF-8 解析失败时按 GBK 回退。

use serde::Deserialize;

use crate::channel::ChannelInfo;
use crate::error::{GbError, Result};

/// 入向 MANSCDP 报文的字段并集。
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ManscdpMessage {
    pub cmd_type: String,
    #[serde(rename = "SN")]
    pub sn: u32,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub status: String,
    pub sum_num: u32,
    pub device_list: DeviceList,
    // MobilePosition 通知
    pub time: String,
    pub longitude: String,
    pub latitude: String,
    pub speed: String,
    pub direction: String,
    pub altitude: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceList {
    #[serde(rename = "@Num")]
    pub num: Option<u32>,
    #[serde(rename = "Item")]
    pub items: Vec<CatalogItem>,
}

/// 目录项：通道信息加上 Notify 场景的 Event。
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CatalogItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
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
    pub status: String,
    /// Notify 专用：ON/OFF/VLOST/DEFECT/ADD/DEL/UPDATE。
    pub event: String,
}

impl CatalogItem {
    pub fn into_channel_info(self) -> ChannelInfo {
        ChannelInfo {
            channel_id: self.device_id,
            parent_id: self.parent_id,
            name: self.name,
            manufacturer: self.manufacturer,
            model: self.model,
            owner: self.owner,
            civil_code: self.civil_code,
            address: self.address,
            port: self.port,
            parental: self.parental,
            register_way: self.register_way,
            secrecy: self.secrecy,
            status: self.status,
        }
    }
}

/// 解析入向 MANSCDP，UTF-8 失败后按 GBK 重试。
pub fn parse_manscdp(body: &[u8]) -> Result<ManscdpMessage> {
    match std::str::from_utf8(body) {
        Ok(text) => match quick_xml::de::from_str(text) {
            Ok(msg) => Ok(msg),
            Err(_) => parse_gbk(body),
        },
        Err(_) => parse_gbk(body),
    }
}

fn parse_gbk(body: &[u8]) -> Result<ManscdpMessage> {
    let (decoded, _, had_errors) = encoding_rs::GBK.decode(body);
    if had_errors {
        return Err(GbError::Xml("body is neither utf-8 nor gbk".to_string()));
    }
    quick_xml::de::from_str(&decoded).map_err(|e| GbError::Xml(e.to_string()))
}

/// 目录查询。
pub fn catalog_query(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>Catalog</CmdType>\r\n\
         <SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
        sn, device_id
    )
}

/// 设备信息查询。
pub fn device_info_query(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>DeviceInfo</CmdType>\r\n\
         <SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
        sn, device_id
    )
}

/// 订阅移动位置上报，interval 为秒。
pub fn mobile_position_query(sn: u32, device_id: &str, interval: u32) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>MobilePosition</CmdType>\r\n\
         <SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<Interval>{}</Interval>\r\n</Query>\r\n",
        sn, device_id, interval
    )
}

/// 报警应答，放在 200 响应体里。
pub fn alarm_response(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Response>\r\n<CmdType>Alarm</CmdType>\r\n\
         <SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<Result>OK</Result>\r\n</Response>\r\n",
        sn, device_id
    )
}
