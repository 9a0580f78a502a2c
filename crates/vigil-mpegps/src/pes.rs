//! PES 包编解码。MPEG-2 用固定 9 字节头 + 可变扩展，MPEG-1 用
//! 填充字节 + 前缀位区分的老式头，两套都要支持（部分老设备只会发 MPEG-1）。

use crate::bits::{BitReader, BitWriter};
use crate::error::{PsError, Result};

#[derive(Debug, Default)]
pub struct PesPacket {
    pub stream_id: u8,
    pub pes_packet_length: u16,
    pub pes_scrambling_control: u8,
    pub pes_priority: u8,
    pub data_alignment_indicator: u8,
    pub copyright: u8,
    pub original_or_copy: u8,
    pub pts_dts_flags: u8,
    pub escr_flag: u8,
    pub es_rate_flag: u8,
    pub dsm_trick_mode_flag: u8,
    pub additional_copy_info_flag: u8,
    pub pes_crc_flag: u8,
    pub pes_extension_flag: u8,
    pub pes_header_data_length: u8,
    /// 33 位 90kHz。
    pub pts: u64,
    pub dts: u64,
    pub escr_base: u64,
    pub escr_extension: u16,
    pub es_rate: u32,
    pub trick_mode_control: u8,
    pub trick_value: u8,
    pub additional_copy_info: u8,
    pub previous_pes_packet_crc: u16,
    pub payload: Vec<u8>,
}

fn read_ts33(bs: &mut BitReader) -> u64 {
    bs.skip_bits(4);
    let mut ts = bs.read_bits(3);
    bs.skip_bits(1);
    ts = ts << 15 | bs.read_bits(15);
    bs.skip_bits(1);
    ts = ts << 15 | bs.read_bits(15);
    bs.skip_bits(1);
    ts
}

fn put_ts33(bsw: &mut BitWriter, prefix: u8, ts: u64) {
    bsw.put_u8(prefix, 4);
    bsw.put_u64(ts >> 30, 3);
    bsw.put_u8(1, 1);
    bsw.put_u64(ts >> 15, 15);
    bsw.put_u8(1, 1);
    bsw.put_u64(ts, 15);
    bsw.put_u8(1, 1);
}

impl PesPacket {
    pub fn decode(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 9 {
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(24);
        self.stream_id = bs.read_u8(8);
        self.pes_packet_length = bs.read_u16(16);
        bs.skip_bits(2);
        self.pes_scrambling_control = bs.read_u8(2);
        self.pes_priority = bs.read_bit();
        self.data_alignment_indicator = bs.read_bit();
        self.copyright = bs.read_bit();
        self.original_or_copy = bs.read_bit();
        self.pts_dts_flags = bs.read_u8(2);
        self.escr_flag = bs.read_bit();
        self.es_rate_flag = bs.read_bit();
        self.dsm_trick_mode_flag = bs.read_bit();
        self.additional_copy_info_flag = bs.read_bit();
        self.pes_crc_flag = bs.read_bit();
        self.pes_extension_flag = bs.read_bit();
        self.pes_header_data_length = bs.read_u8(8);
        if bs.remain_bytes() < usize::from(self.pes_header_data_length) {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        bs.mark();
        if self.pts_dts_flags & 0x02 == 0x02 {
            self.pts = read_ts33(bs);
        }
        if self.pts_dts_flags & 0x03 == 0x03 {
            self.dts = read_ts33(bs);
        } else {
            self.dts = self.pts;
        }
        if self.escr_flag == 1 {
            bs.skip_bits(2);
            let mut base = bs.read_bits(3);
            bs.skip_bits(1);
            base = base << 15 | bs.read_bits(15);
            bs.skip_bits(1);
            base = base << 15 | bs.read_bits(15);
            bs.skip_bits(1);
            self.escr_base = base;
            self.escr_extension = bs.read_u16(9);
            bs.skip_bits(1);
        }
        if self.es_rate_flag == 1 {
            bs.skip_bits(1);
            self.es_rate = bs.read_u32(22);
            bs.skip_bits(1);
        }
        if self.dsm_trick_mode_flag == 1 {
            self.trick_mode_control = bs.read_u8(3);
            self.trick_value = bs.read_u8(5);
        }
        if self.additional_copy_info_flag == 1 {
            self.additional_copy_info = bs.read_u8(7);
        }
        if self.pes_crc_flag == 1 {
            self.previous_pes_packet_crc = bs.read_u16(16);
        }
        let consumed = bs.bits_since_mark();
        let header_bits = usize::from(self.pes_header_data_length) * 8;
        if consumed > header_bits {
            return Err(PsError::Parser("pes header data length inconsistent"));
        }
        bs.skip_bits(header_bits - consumed);

        if self.pes_packet_length == 0 {
            // 无界 PES（只允许视频），取到当前输入末尾。
            self.payload.clear();
            self.payload.extend_from_slice(bs.remaining());
            bs.skip_bits(bs.remain_bits());
            return Ok(());
        }
        // 包长覆盖 flags(2) + header_data_length(1) + 头 + 载荷。
        let Some(data_len) = (usize::from(self.pes_packet_length))
            .checked_sub(3 + usize::from(self.pes_header_data_length))
        else {
            return Err(PsError::Parser("pes packet length inconsistent"));
        };
        if bs.remain_bytes() < data_len {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        self.payload.clear();
        self.payload.extend_from_slice(&bs.remaining()[..data_len]);
        bs.skip_bits(data_len * 8);
        Ok(())
    }

    pub fn decode_mpeg1(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 6 {
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(24);
        self.stream_id = bs.read_u8(8);
        self.pes_packet_length = bs.read_u16(16);
        if self.pes_packet_length != 0
            && bs.remain_bytes() < usize::from(self.pes_packet_length)
        {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        bs.mark();
        while bs.next_bits(8) == Some(0xFF) {
            bs.skip_bits(8);
        }
        if bs.next_bits(2) == Some(0b01) {
            // STD buffer 字段。
            bs.skip_bits(16);
        }
        if bs.next_bits(4) == Some(0x02) {
            self.pts = read_ts33(bs);
            self.dts = self.pts;
        } else if bs.next_bits(4) == Some(0x03) {
            self.pts = read_ts33(bs);
            self.dts = read_ts33(bs);
        } else if bs.next_bits(8) == Some(0x0F) {
            bs.skip_bits(8);
        } else {
            return Err(PsError::Parser("mpeg1 pes header marker unrecognized"));
        }
        let header_len = bs.bits_since_mark() / 8;
        if self.pes_packet_length != 0 && usize::from(self.pes_packet_length) < header_len {
            return Err(PsError::Parser("mpeg1 pes packet length inconsistent"));
        }
        self.payload.clear();
        if self.pes_packet_length == 0
            || bs.remain_bytes() <= usize::from(self.pes_packet_length) - header_len
        {
            self.payload.extend_from_slice(bs.remaining());
            bs.skip_bits(bs.remain_bits());
        } else {
            let data_len = usize::from(self.pes_packet_length) - header_len;
            self.payload.extend_from_slice(&bs.remaining()[..data_len]);
            bs.skip_bits(data_len * 8);
        }
        Ok(())
    }

    pub fn encode(&self, bsw: &mut BitWriter) {
        bsw.put_bytes(&[0x00, 0x00, 0x01]);
        bsw.put_byte(self.stream_id);
        bsw.put_u16(self.pes_packet_length, 16);
        bsw.put_u8(0x02, 2);
        bsw.put_u8(self.pes_scrambling_control, 2);
        bsw.put_u8(self.pes_priority, 1);
        bsw.put_u8(self.data_alignment_indicator, 1);
        bsw.put_u8(self.copyright, 1);
        bsw.put_u8(self.original_or_copy, 1);
        bsw.put_u8(self.pts_dts_flags, 2);
        bsw.put_u8(self.escr_flag, 1);
        bsw.put_u8(self.es_rate_flag, 1);
        bsw.put_u8(self.dsm_trick_mode_flag, 1);
        bsw.put_u8(self.additional_copy_info_flag, 1);
        bsw.put_u8(self.pes_crc_flag, 1);
        bsw.put_u8(self.pes_extension_flag, 1);
        bsw.put_byte(self.pes_header_data_length);
        if self.pts_dts_flags == 0x02 {
            put_ts33(bsw, 0x02, self.pts);
        }
        if self.pts_dts_flags == 0x03 {
            put_ts33(bsw, 0x03, self.pts);
            put_ts33(bsw, 0x01, self.dts);
        }
        if self.escr_flag == 1 {
            bsw.put_u8(0x03, 2);
            bsw.put_u64(self.escr_base >> 30, 3);
            bsw.put_u8(1, 1);
            bsw.put_u64(self.escr_base >> 15, 15);
            bsw.put_u8(1, 1);
            bsw.put_u64(self.escr_base, 15);
            bsw.put_u8(1, 1);
        }
        bsw.put_bytes(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pes_round_trip_with_pts_dts() {
        let payload = vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80];
        let pes = PesPacket {
            stream_id: 0xE0,
            pes_packet_length: (3 + 10 + payload.len()) as u16,
            pts_dts_flags: 0x03,
            pes_header_data_length: 10,
            pts: 180_000,
            dts: 176_400,
            payload: payload.clone(),
            ..Default::default()
        };
        let mut bsw = BitWriter::new(64);
        pes.encode(&mut bsw);
        let mut decoded = PesPacket::default();
        decoded.decode(&mut BitReader::new(bsw.data())).unwrap();
        assert_eq!(decoded.stream_id, 0xE0);
        assert_eq!(decoded.pts, 180_000);
        assert_eq!(decoded.dts, 176_400);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn pes_without_dts_copies_pts() {
        let pes = PesPacket {
            stream_id: 0xC0,
            pes_packet_length: (3 + 5 + 4) as u16,
            pts_dts_flags: 0x02,
            pes_header_data_length: 5,
            pts: 90_000,
            payload: vec![1, 2, 3, 4],
            ..Default::default()
        };
        let mut bsw = BitWriter::new(32);
        pes.encode(&mut bsw);
        let mut decoded = PesPacket::default();
        decoded.decode(&mut BitReader::new(bsw.data())).unwrap();
        assert_eq!(decoded.pts, 90_000);
        assert_eq!(decoded.dts, 90_000);
    }

    #[test]
    fn truncated_pes_payload_asks_for_more() {
        let pes = PesPacket {
            stream_id: 0xE0,
            pes_packet_length: (3 + 10 + 100) as u16,
            pts_dts_flags: 0x03,
            pes_header_data_length: 10,
            pts: 3600,
            dts: 3600,
            payload: vec![0xAB; 100],
            ..Default::default()
        };
        let mut bsw = BitWriter::new(160);
        pes.encode(&mut bsw);
        let cut = &bsw.data()[..bsw.data().len() - 40];
        let mut bs = BitReader::new(cut);
        let mut decoded = PesPacket::default();
        let err = decoded.decode(&mut bs).unwrap_err();
        assert!(err.is_need_more());
        assert_eq!(bs.pos(), 0);
    }

    #[test]
    fn unbounded_pes_takes_rest_of_input() {
        let pes = PesPacket {
            stream_id: 0xE0,
            pes_packet_length: 0,
            pts_dts_flags: 0x02,
            pes_header_data_length: 5,
            pts: 7200,
            payload: vec![0xCD; 32],
            ..Default::default()
        };
        let mut bsw = BitWriter::new(64);
        pes.encode(&mut bsw);
        let mut decoded = PesPacket::default();
        decoded.decode(&mut BitReader::new(bsw.data())).unwrap();
        assert_eq!(decoded.payload, vec![0xCD; 32]);
    }
}
