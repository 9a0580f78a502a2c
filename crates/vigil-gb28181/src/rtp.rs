//! RTP 包解析（RFC 3550 固定头 + CSRC + 扩展 + padding）。
//!
//! 国标收流只需要读头取 SSRC/时间戳/序号，载荷原样交给 PS 解复用。

use bytes::Bytes;

use crate::error::{GbError, Result};

pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < RTP_HEADER_LEN {
            return Err(GbError::Media(format!("rtp packet too short: {}", data.len())));
        }
        let header = RtpHeader {
            version: data[0] >> 6,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0F,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };
        if header.version != 2 {
            return Err(GbError::Media(format!("unsupported rtp version: {}", header.version)));
        }

        let mut offset = RTP_HEADER_LEN + header.csrc_count as usize * 4;
        if data.len() < offset {
            return Err(GbError::Media("rtp csrc list truncated".to_string()));
        }
        if header.extension {
            if data.len() < offset + 4 {
                return Err(GbError::Media("rtp extension truncated".to_string()));
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
            if data.len() < offset {
                return Err(GbError::Media("rtp extension truncated".to_string()));
            }
        }

        let mut end = data.len();
        if header.padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(GbError::Media("bad rtp padding".to_string()));
            }
            end -= pad;
        }
        Ok(RtpPacket { header, payload: Bytes::copy_from_slice(&data[offset..end]) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_packet() {
        let mut data = vec![
            0x80, 0x60, 0x00, 0x01, // V=2, PT=96, seq=1
            0x00, 0x00, 0x0E, 0x10, // ts=3600
            0x0B, 0xEB, 0xC2, 0x0C, // ssrc=200000012
        ];
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let pkt = RtpPacket::parse(&data).unwrap();
        assert_eq!(pkt.header.payload_type, 96);
        assert_eq!(pkt.header.sequence_number, 1);
        assert_eq!(pkt.header.timestamp, 3600);
        assert_eq!(pkt.header.ssrc, 200_000_012);
        assert_eq!(&pkt.payload[..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn parse_with_csrc_and_padding() {
        let mut data = vec![
            0xA1, 0xE0, 0x12, 0x34, // V=2, padding, 1 CSRC, marker, PT=96
            0x00, 0x00, 0x00, 0x64, //
            0x00, 0x00, 0x00, 0x07, //
        ];
        data.extend_from_slice(&[0, 0, 0, 9]); // CSRC
        data.extend_from_slice(&[0x11, 0x22]); // payload
        data.extend_from_slice(&[0x00, 0x02]); // 2 字节 padding
        let pkt = RtpPacket::parse(&data).unwrap();
        assert!(pkt.header.marker);
        assert_eq!(pkt.header.ssrc, 7);
        assert_eq!(&pkt.payload[..], &[0x11, 0x22]);
    }

    #[test]
    fn rejects_short_or_wrong_version() {
        assert!(RtpPacket::parse(&[0x80, 0x60, 0, 1]).is_err());
        let data = [0x40u8; 12]; // V=1
        assert!(RtpPacket::parse(&data).is_err());
    }
}
