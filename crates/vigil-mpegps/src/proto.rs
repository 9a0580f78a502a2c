//! pack 层各类包头的编解码（ISO/IEC 13818-1 表 2-33 起）。
//!
//! 解码失败分两类：数据不够（回退游标并返回 `NeedMore`，调用方缓存续喂）
//! 和结构损坏（`Parser`，由上层决定丢弃重同步）。

use crate::bits::{BitReader, BitWriter};
use crate::error::{PsError, Result};
use crate::types::{PS_CODE_PACK, PS_CODE_PSD, PS_CODE_SYSTEM};

/// pack_header()。MPEG-1 与 MPEG-2 的 pack 头靠起始码后的前几位区分：
/// `01` 为 MPEG-2，`0010` 为 MPEG-1。
#[derive(Debug, Default)]
pub struct PsPackHeader {
    pub is_mpeg1: bool,
    /// 33 位 SCR base，90kHz。
    pub scr_base: u64,
    /// 9 位 SCR extension。
    pub scr_ext: u16,
    /// 22 位。
    pub program_mux_rate: u32,
    pub pack_stuffing_length: u8,
}

impl PsPackHeader {
    pub fn decode(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 5 {
            return Err(PsError::NeedMore);
        }
        if bs.read_u32(32) != PS_CODE_PACK {
            return Err(PsError::Parser("pack header must start with 000001BA"));
        }
        if bs.next_bits(2) == Some(0b01) {
            if bs.remain_bytes() < 10 {
                bs.seek(at);
                return Err(PsError::NeedMore);
            }
            self.is_mpeg1 = false;
            self.decode_mpeg2(bs, at)
        } else if bs.next_bits(4) == Some(0b0010) {
            if bs.remain_bytes() < 8 {
                bs.seek(at);
                return Err(PsError::NeedMore);
            }
            self.is_mpeg1 = true;
            self.decode_mpeg1(bs)
        } else {
            Err(PsError::Parser("pack header version bits unrecognized"))
        }
    }

    fn decode_mpeg2(&mut self, bs: &mut BitReader, at: usize) -> Result<()> {
        bs.skip_bits(2);
        let mut base = bs.read_bits(3);
        bs.skip_bits(1);
        base = base << 15 | bs.read_bits(15);
        bs.skip_bits(1);
        base = base << 15 | bs.read_bits(15);
        bs.skip_bits(1);
        self.scr_base = base;
        self.scr_ext = bs.read_u16(9);
        bs.skip_bits(1);
        self.program_mux_rate = bs.read_u32(22);
        bs.skip_bits(2);
        bs.skip_bits(5);
        self.pack_stuffing_length = bs.read_u8(3);
        if bs.remain_bytes() < usize::from(self.pack_stuffing_length) {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(usize::from(self.pack_stuffing_length) * 8);
        Ok(())
    }

    fn decode_mpeg1(&mut self, bs: &mut BitReader) -> Result<()> {
        bs.skip_bits(4);
        let mut base = bs.read_bits(3);
        bs.skip_bits(1);
        base = base << 15 | bs.read_bits(15);
        bs.skip_bits(1);
        base = base << 15 | bs.read_bits(15);
        bs.skip_bits(1);
        self.scr_base = base;
        self.scr_ext = 1;
        let mut rate = bs.read_u32(7);
        bs.skip_bits(1);
        rate = rate << 15 | bs.read_u32(15);
        bs.skip_bits(1);
        self.program_mux_rate = rate;
        Ok(())
    }

    pub fn encode(&self, bsw: &mut BitWriter) {
        bsw.put_bytes(&[0x00, 0x00, 0x01, 0xBA]);
        bsw.put_u8(1, 2);
        bsw.put_u64(self.scr_base >> 30, 3);
        bsw.put_u8(1, 1);
        bsw.put_u64(self.scr_base >> 15, 15);
        bsw.put_u8(1, 1);
        bsw.put_u64(self.scr_base, 15);
        bsw.put_u8(1, 1);
        bsw.put_u16(self.scr_ext, 9);
        bsw.put_u8(1, 1);
        bsw.put_u32(self.program_mux_rate, 22);
        bsw.put_u8(1, 1);
        bsw.put_u8(1, 1);
        bsw.put_u8(0x1F, 5);
        bsw.put_u8(self.pack_stuffing_length, 3);
        bsw.put_repeat(0xFF, usize::from(self.pack_stuffing_length));
    }
}

/// system header 里声明的单路流及其 P-STD 缓冲参数。
#[derive(Debug)]
pub struct ElementaryStream {
    pub stream_id: u8,
    pub pstd_buffer_bound_scale: u8,
    pub pstd_buffer_size_bound: u16,
}

impl ElementaryStream {
    pub fn new(stream_id: u8) -> Self {
        ElementaryStream { stream_id, pstd_buffer_bound_scale: 0, pstd_buffer_size_bound: 0 }
    }
}

/// system_header()。
#[derive(Debug, Default)]
pub struct SystemHeader {
    pub header_length: u16,
    pub rate_bound: u32,
    pub audio_bound: u8,
    pub fixed_flag: u8,
    pub csps_flag: u8,
    pub system_audio_lock_flag: u8,
    pub system_video_lock_flag: u8,
    pub video_bound: u8,
    pub packet_rate_restriction_flag: u8,
    pub streams: Vec<ElementaryStream>,
}

impl SystemHeader {
    pub fn decode(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 12 {
            return Err(PsError::NeedMore);
        }
        if bs.read_u32(32) != PS_CODE_SYSTEM {
            return Err(PsError::Parser("system header must start with 000001BB"));
        }
        self.header_length = bs.read_u16(16);
        if bs.remain_bytes() < usize::from(self.header_length) {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        // 固定部分 6 字节，其后每路流 3 字节。
        if self.header_length < 6 || (self.header_length - 6) % 3 != 0 {
            return Err(PsError::Parser("system header length inconsistent"));
        }
        bs.skip_bits(1);
        self.rate_bound = bs.read_u32(22);
        bs.skip_bits(1);
        self.audio_bound = bs.read_u8(6);
        self.fixed_flag = bs.read_bit();
        self.csps_flag = bs.read_bit();
        self.system_audio_lock_flag = bs.read_bit();
        self.system_video_lock_flag = bs.read_bit();
        bs.skip_bits(1);
        self.video_bound = bs.read_u8(5);
        self.packet_rate_restriction_flag = bs.read_bit();
        bs.skip_bits(7);
        self.streams.clear();
        let mut least = self.header_length - 6;
        while least > 0 && bs.next_bits(1) == Some(1) {
            let mut es = ElementaryStream::new(bs.read_u8(8));
            bs.skip_bits(2);
            es.pstd_buffer_bound_scale = bs.read_bit();
            es.pstd_buffer_size_bound = bs.read_u16(13);
            self.streams.push(es);
            least -= 3;
        }
        if least > 0 {
            return Err(PsError::Parser("system header stream list truncated"));
        }
        Ok(())
    }

    pub fn encode(&self, bsw: &mut BitWriter) {
        bsw.put_bytes(&[0x00, 0x00, 0x01, 0xBB]);
        let loc = bsw.byte_offset();
        bsw.put_u16(0, 16);
        bsw.mark();
        bsw.put_u8(1, 1);
        bsw.put_u32(self.rate_bound, 22);
        bsw.put_u8(1, 1);
        bsw.put_u8(self.audio_bound, 6);
        bsw.put_u8(self.fixed_flag, 1);
        bsw.put_u8(self.csps_flag, 1);
        bsw.put_u8(self.system_audio_lock_flag, 1);
        bsw.put_u8(self.system_video_lock_flag, 1);
        bsw.put_u8(1, 1);
        bsw.put_u8(self.video_bound, 5);
        bsw.put_u8(self.packet_rate_restriction_flag, 1);
        bsw.put_u8(0x7F, 7);
        for es in &self.streams {
            bsw.put_u8(es.stream_id, 8);
            bsw.put_u8(3, 2);
            bsw.put_u8(es.pstd_buffer_bound_scale, 1);
            bsw.put_u16(es.pstd_buffer_size_bound, 13);
        }
        let length = bsw.bits_since_mark() / 8;
        bsw.set_u16_at(length as u16, loc);
    }
}

/// PSM 的单条流映射：stream_type -> elementary_stream_id。
#[derive(Debug)]
pub struct ElementaryStreamElem {
    pub stream_type: u8,
    pub elementary_stream_id: u8,
    pub elementary_stream_info_length: u16,
}

impl ElementaryStreamElem {
    pub fn new(stream_type: u8, elementary_stream_id: u8) -> Self {
        ElementaryStreamElem { stream_type, elementary_stream_id, elementary_stream_info_length: 0 }
    }
}

/// program_stream_map()。
#[derive(Debug, Default)]
pub struct ProgramStreamMap {
    pub map_stream_id: u8,
    pub program_stream_map_length: u16,
    pub current_next_indicator: u8,
    pub program_stream_map_version: u8,
    pub program_stream_info_length: u16,
    pub elementary_stream_map_length: u16,
    pub stream_map: Vec<ElementaryStreamElem>,
}

impl ProgramStreamMap {
    pub fn decode(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 16 {
            return Err(PsError::NeedMore);
        }
        if bs.read_u32(24) != 0x0000_01 {
            return Err(PsError::Parser("program stream map must start with 000001"));
        }
        self.map_stream_id = bs.read_u8(8);
        if self.map_stream_id != 0xBC {
            return Err(PsError::Parser("map stream id must be 0xBC"));
        }
        self.program_stream_map_length = bs.read_u16(16);
        if bs.remain_bytes() < usize::from(self.program_stream_map_length) {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        self.current_next_indicator = bs.read_bit();
        bs.skip_bits(2);
        self.program_stream_map_version = bs.read_u8(5);
        bs.skip_bits(8);
        self.program_stream_info_length = bs.read_u16(16);
        if bs.remain_bytes() < usize::from(self.program_stream_info_length) + 2 {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(usize::from(self.program_stream_info_length) * 8);
        // 字段本身不可信（部分设备填 0），按外层长度反推。
        bs.skip_bits(16);
        let Some(es_map_length) = self
            .program_stream_map_length
            .checked_sub(self.program_stream_info_length + 10)
        else {
            return Err(PsError::Parser("program stream map length inconsistent"));
        };
        self.elementary_stream_map_length = es_map_length;
        if bs.remain_bytes() < usize::from(es_map_length) + 4 {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        self.stream_map.clear();
        let mut consumed = 0usize;
        while consumed < usize::from(es_map_length) {
            let stream_type = bs.read_u8(8);
            let sid = bs.read_u8(8);
            let mut elem = ElementaryStreamElem::new(stream_type, sid);
            elem.elementary_stream_info_length = bs.read_u16(16);
            if bs.remain_bytes() < usize::from(elem.elementary_stream_info_length) {
                return Err(PsError::Parser("elementary stream descriptor truncated"));
            }
            bs.skip_bits(usize::from(elem.elementary_stream_info_length) * 8);
            consumed += 4 + usize::from(elem.elementary_stream_info_length);
            self.stream_map.push(elem);
        }
        if consumed != usize::from(es_map_length) {
            return Err(PsError::Parser("elementary stream map length inconsistent"));
        }
        // CRC_32，不校验。
        bs.skip_bits(32);
        Ok(())
    }

    pub fn encode(&mut self, bsw: &mut BitWriter) {
        bsw.put_bytes(&[0x00, 0x00, 0x01, 0xBC]);
        let loc = bsw.byte_offset();
        bsw.put_u16(0, 16);
        bsw.mark();
        bsw.put_u8(self.current_next_indicator, 1);
        bsw.put_u8(3, 2);
        bsw.put_u8(self.program_stream_map_version, 5);
        bsw.put_u8(0x7F, 7);
        bsw.put_u8(1, 1);
        bsw.put_u16(0, 16);
        self.elementary_stream_map_length = (self.stream_map.len() * 4) as u16;
        bsw.put_u16(self.elementary_stream_map_length, 16);
        for elem in &self.stream_map {
            bsw.put_u8(elem.stream_type, 8);
            bsw.put_u8(elem.elementary_stream_id, 8);
            bsw.put_u16(0, 16);
        }
        let length = (bsw.bits_since_mark() / 8 + 4) as u16;
        bsw.set_u16_at(length, loc);
        let end = bsw.byte_offset();
        let crc_from = end - usize::from(length - 4) - 4;
        let crc = crc32_mpeg(0xFFFF_FFFF, &bsw.data()[crc_from..end]);
        bsw.put_bytes(&crc.to_le_bytes());
    }
}

/// program_stream_directory()，只按长度跳过。
#[derive(Debug, Default)]
pub struct ProgramStreamDirectory {
    pub pes_packet_length: u16,
}

impl ProgramStreamDirectory {
    pub fn decode(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 6 {
            return Err(PsError::NeedMore);
        }
        if bs.read_u32(32) != PS_CODE_PSD {
            return Err(PsError::Parser("program stream directory must start with 000001FF"));
        }
        self.pes_packet_length = bs.read_u16(16);
        if bs.remain_bytes() < usize::from(self.pes_packet_length) {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(usize::from(self.pes_packet_length) * 8);
        Ok(())
    }
}

/// 不关心负载的 PES（私有流、padding、ECM/EMM），整包跳过。
#[derive(Debug, Default)]
pub struct CommonPesPacket {
    pub stream_id: u8,
    pub pes_packet_length: u16,
}

impl CommonPesPacket {
    pub fn decode(&mut self, bs: &mut BitReader) -> Result<()> {
        let at = bs.pos();
        if bs.remain_bytes() < 6 {
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(24);
        self.stream_id = bs.read_u8(8);
        self.pes_packet_length = bs.read_u16(16);
        if bs.remain_bytes() < usize::from(self.pes_packet_length) {
            bs.seek(at);
            return Err(PsError::NeedMore);
        }
        bs.skip_bits(usize::from(self.pes_packet_length) * 8);
        Ok(())
    }
}

/// MPEG-2 CRC32（poly 0x04C11DB7，初值全 1）。
pub(crate) fn crc32_mpeg(init: u32, data: &[u8]) -> u32 {
    let mut crc = init;
    for &b in data {
        crc ^= u32::from(b) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04C1_1DB7 } else { crc << 1 };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_header_round_trip() {
        let header = PsPackHeader {
            is_mpeg1: false,
            scr_base: 0x1_2345_6789 & 0x1_FFFF_FFFF,
            scr_ext: 5,
            program_mux_rate: 6106,
            pack_stuffing_length: 2,
        };
        let mut bsw = BitWriter::new(32);
        header.encode(&mut bsw);
        let mut bs = BitReader::new(bsw.data());
        let mut decoded = PsPackHeader::default();
        decoded.decode(&mut bs).unwrap();
        assert!(!decoded.is_mpeg1);
        assert_eq!(decoded.scr_base, header.scr_base);
        assert_eq!(decoded.scr_ext, 5);
        assert_eq!(decoded.program_mux_rate, 6106);
        assert_eq!(decoded.pack_stuffing_length, 2);
        assert!(bs.eos());
    }

    #[test]
    fn system_header_round_trip() {
        let mut sh = SystemHeader { rate_bound: 26234, ..Default::default() };
        let mut es = ElementaryStream::new(0xE0);
        es.pstd_buffer_bound_scale = 1;
        es.pstd_buffer_size_bound = 400;
        sh.streams.push(es);
        let mut bsw = BitWriter::new(32);
        sh.encode(&mut bsw);
        let mut decoded = SystemHeader::default();
        decoded.decode(&mut BitReader::new(bsw.data())).unwrap();
        assert_eq!(decoded.header_length, 9);
        assert_eq!(decoded.rate_bound, 26234);
        assert_eq!(decoded.streams.len(), 1);
        assert_eq!(decoded.streams[0].stream_id, 0xE0);
        assert_eq!(decoded.streams[0].pstd_buffer_size_bound, 400);
    }

    #[test]
    fn psm_round_trip() {
        let mut psm = ProgramStreamMap {
            current_next_indicator: 1,
            program_stream_map_version: 1,
            ..Default::default()
        };
        psm.stream_map.push(ElementaryStreamElem::new(0x1B, 0xE0));
        psm.stream_map.push(ElementaryStreamElem::new(0x90, 0xC0));
        let mut bsw = BitWriter::new(64);
        psm.encode(&mut bsw);
        let mut decoded = ProgramStreamMap::default();
        decoded.decode(&mut BitReader::new(bsw.data())).unwrap();
        assert_eq!(decoded.stream_map.len(), 2);
        assert_eq!(decoded.stream_map[0].stream_type, 0x1B);
        assert_eq!(decoded.stream_map[0].elementary_stream_id, 0xE0);
        assert_eq!(decoded.stream_map[1].stream_type, 0x90);
        assert_eq!(decoded.stream_map[1].elementary_stream_id, 0xC0);
    }

    #[test]
    fn truncated_system_header_rewinds_cursor() {
        let data = [0x00, 0x00, 0x01, 0xBB, 0x00, 0x20, 0x00, 0x01, 0x33, 0x44, 0xFF, 0x34];
        let mut bs = BitReader::new(&data);
        let mut sh = SystemHeader::default();
        let err = sh.decode(&mut bs).unwrap_err();
        assert!(err.is_need_more());
        assert_eq!(bs.pos(), 0);
        assert_eq!(bs.remaining(), &data);
    }

    #[test]
    fn bogus_system_header_length_is_a_parse_error() {
        // header_length = 1：比固定部分还短。
        let data = [
            0x00, 0x00, 0x01, 0xBB, 0x00, 0x01, 0x00, 0x01, 0x33, 0x44, 0xFF, 0x34,
        ];
        let mut sh = SystemHeader::default();
        let err = sh.decode(&mut BitReader::new(&data)).unwrap_err();
        assert!(matches!(err, PsError::Parser(_)));
    }

    #[test]
    fn crc32_mpeg_known_vector() {
        // 全零输入只搬移初值。
        assert_eq!(crc32_mpeg(0xFFFF_FFFF, &[]), 0xFFFF_FFFF);
        let a = crc32_mpeg(0xFFFF_FFFF, b"123456789");
        assert_eq!(a, 0x0376_E6E7);
    }
}
