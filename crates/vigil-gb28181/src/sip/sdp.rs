//! INVITE 的 SDP 生成与应答解析。
//!
//! 国标 SDP 带两个私有扩展：`y=` 行声明 SSRC，`f=` 行声明媒体格式，
//! 这里只处理 `y=`；应答里的 `m=` 行决定设备走 TCP 还是 UDP 发流。

/// 发给设备的媒体邀约。
#[derive(Debug, Clone)]
pub struct SdpOffer<'a> {
    pub channel_id: &'a str,
    pub media_ip: &'a str,
    pub media_port: u16,
    /// `Play` 实时，`Playback` 回放。
    pub session_name: &'a str,
    pub start: i64,
    pub end: i64,
    pub ssrc: &'a str,
    pub tcp: bool,
}

impl SdpOffer<'_> {
    pub fn build(&self) -> String {
        let proto = if self.tcp { "TCP/RTP/AVP" } else { "RTP/AVP" };
        let mut sdp = format!(
            "v=0\r\n\
             o={} 0 0 IN IP4 {}\r\n\
             s={}\r\n\
             c=IN IP4 {}\r\n\
             t={} {}\r\n\
             m=video {} {} 96\r\n\
             a=recvonly\r\n\
             a=rtpmap:96 PS/90000\r\n",
            self.channel_id,
            self.media_ip,
            self.session_name,
            self.media_ip,
            self.start,
            self.end,
            self.media_port,
            proto,
        );
        if self.tcp {
            sdp.push_str("a=setup:passive\r\na=connection:new\r\n");
        }
        sdp.push_str(&format!("y={}\r\n", self.ssrc));
        sdp
    }
}

/// 设备 200 应答里需要关心的字段。
#[derive(Debug, Clone, Default)]
pub struct SdpAnswer {
    /// 设备改写后的 SSRC（y= 行）。
    pub ssrc: Option<u32>,
    /// 设备是否接受 TCP 发流。
    pub tcp: bool,
    pub media_port: u16,
}

/// 容错解析：行分隔符 \r\n 或 \n 都接受，认不出的行跳过。
pub fn parse_answer(body: &str) -> SdpAnswer {
    let mut answer = SdpAnswer::default();
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("y=") {
            answer.ssrc = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("m=video ") {
            let mut parts = rest.split_whitespace();
            answer.media_port = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            answer.tcp = parts.next().is_some_and(|proto| proto.contains("TCP"));
        }
    }
    answer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_udp_layout() {
        let offer = SdpOffer {
            channel_id: "34020000001320000001",
            media_ip: "192.168.1.10",
            media_port: 30002,
            session_name: "Play",
            start: 0,
            end: 0,
            ssrc: "0200000123",
            tcp: false,
        };
        let sdp = offer.build();
        assert!(sdp.starts_with("v=0\r\no=34020000001320000001 0 0 IN IP4 192.168.1.10\r\n"));
        assert!(sdp.contains("m=video 30002 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 PS/90000\r\n"));
        assert!(sdp.ends_with("y=0200000123\r\n"));
        assert!(!sdp.contains("setup:passive"));
    }

    #[test]
    fn offer_tcp_adds_setup_lines() {
        let offer = SdpOffer {
            channel_id: "34020000001320000001",
            media_ip: "192.168.1.10",
            media_port: 30002,
            session_name: "Playback",
            start: 1700000000,
            end: 1700000600,
            ssrc: "1200000123",
            tcp: true,
        };
        let sdp = offer.build();
        assert!(sdp.contains("m=video 30002 TCP/RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=setup:passive\r\n"));
        assert!(sdp.contains("t=1700000000 1700000600\r\n"));
    }

    #[test]
    fn answer_extracts_ssrc_and_transport() {
        let body = "v=0\no=34020000001320000001 0 0 IN IP4 192.168.1.64\ns=Play\n\
                    c=IN IP4 192.168.1.64\nt=0 0\nm=video 15060 TCP/RTP/AVP 96\n\
                    a=sendonly\ny=0200000456\n";
        let answer = parse_answer(body);
        assert_eq!(answer.ssrc, Some(200000456));
        assert!(answer.tcp);
        assert_eq!(answer.media_port, 15060);
    }

    #[test]
    fn answer_without_y_line() {
        let answer = parse_answer("v=0\r\nm=video 15060 RTP/AVP 96\r\n");
        assert_eq!(answer.ssrc, None);
        assert!(!answer.tcp);
    }
}
