//! SIP 报文结构定义与编解码。
//!
//! 国标信令只用到 SIP 的一个子集，报文一律单包收发，
//! 所以这里按行切分解析即可，不做流式增量解析。
//! 报文体保持原始字节：MANSCDP 可能是 GB2312 编码，不能提前按 UTF-8 转换。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{GbError, Result};

/// SIP 方法类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Message,
    Notify,
    Subscribe,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Message => "MESSAGE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Info => "INFO",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SipMethod {
    type Err = GbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "CANCEL" => Ok(SipMethod::Cancel),
            "OPTIONS" => Ok(SipMethod::Options),
            "MESSAGE" => Ok(SipMethod::Message),
            "NOTIFY" => Ok(SipMethod::Notify),
            "SUBSCRIBE" => Ok(SipMethod::Subscribe),
            "INFO" => Ok(SipMethod::Info),
            other => Err(GbError::Sip(format!("unknown method: {}", other))),
        }
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        SipRequest {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// 按报文名大小写不敏感取头域。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.set_header("Content-Type", content_type);
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// From 头里的用户部分，注册消息里就是设备国标编码。
    pub fn from_user(&self) -> Option<String> {
        self.header("From").and_then(uri_user)
    }

    pub fn to_user(&self) -> Option<String> {
        self.header("To").and_then(uri_user)
    }

    pub fn expires(&self) -> Option<i64> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// CSeq 头，返回（序号，方法名）。
    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version).into_bytes();
        append_headers(&mut out, &self.headers, self.body.as_deref());
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (head, body) = split_head_body(data)?;
        let mut lines = head.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| GbError::Sip("empty request".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| GbError::Sip("missing method".to_string()))?
            .parse()?;
        let uri = parts
            .next()
            .ok_or_else(|| GbError::Sip("missing uri".to_string()))?
            .to_string();
        let version = parts
            .next()
            .ok_or_else(|| GbError::Sip("missing version".to_string()))?
            .to_string();
        Ok(SipRequest { method, uri, version, headers: parse_headers(lines), body })
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        SipResponse {
            version: "SIP/2.0".to_string(),
            status_code,
            reason: reason.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// 从请求派生响应，拷贝事务相关头域；To 头没有 tag 时补一个。
    pub fn from_request(req: &SipRequest, status_code: u16, reason: &str) -> Self {
        let mut resp = SipResponse::new(status_code, reason);
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.header(name) {
                resp.set_header(name, value);
            }
        }
        if let Some(to) = resp.header("To") {
            if !to.contains(";tag=") {
                let tagged = format!("{};tag={}", to, super::rand_digits(9));
                resp.set_header("To", tagged);
            }
        }
        resp
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.set_header("Content-Type", content_type);
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            format!("{} {} {}\r\n", self.version, self.status_code, self.reason).into_bytes();
        append_headers(&mut out, &self.headers, self.body.as_deref());
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (head, body) = split_head_body(data)?;
        let mut lines = head.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| GbError::Sip("empty response".to_string()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| GbError::Sip("missing version".to_string()))?
            .to_string();
        let status_code = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GbError::Sip("bad status code".to_string()))?;
        let reason = parts.next().unwrap_or("").to_string();
        Ok(SipResponse { version, status_code, reason, headers: parse_headers(lines), body })
    }
}

/// 收到的 SIP 报文，按首行区分请求和响应。
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.starts_with(b"SIP/") {
            Ok(SipMessage::Response(SipResponse::from_bytes(data)?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_bytes(data)?))
        }
    }
}

/// 从 `"name" <sip:user@host>;tag=x` 或 `sip:user@host` 里取出 user。
pub fn uri_user(value: &str) -> Option<String> {
    let at = value.find("sip:")?;
    let rest = &value[at + 4..];
    let end = rest.find(['@', '>', ';', ' ']).unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

fn split_head_body(data: &[u8]) -> Result<(String, Option<Bytes>)> {
    let (head, body) = match data.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(idx) => {
            let body = &data[idx + 4..];
            let body = if body.is_empty() { None } else { Some(Bytes::copy_from_slice(body)) };
            (&data[..idx], body)
        }
        None => (data, None),
    };
    let head = std::str::from_utf8(head)
        .map_err(|_| GbError::Sip("header is not valid utf-8".to_string()))?;
    Ok((head.to_string(), body))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    headers
}

fn append_headers(out: &mut Vec<u8>, headers: &HashMap<String, String>, body: Option<&[u8]>) {
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    let len = body.map(<[u8]>::len).unwrap_or(0);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", len).as_bytes());
}
