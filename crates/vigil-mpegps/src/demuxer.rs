//! PS 解复用器。
//!
//! 输入任意切分的 PS 字节流（通常是去掉 RTP 头的负载），内部缓存半包、
//! 维护 PSM 声明的流表，把跨多个 PES 的访问单元聚合成完整帧。产出的帧
//! 进入内部队列，由调用方 [`PsDemuxer::poll_frame`] 逐个取走。

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::debug;

use crate::error::{PsError, Result};
use crate::h26x::{
    self, detect_codec, VideoCodec, H264_NALU_AUD, H265_NALU_AUD,
};
use crate::pes::PesPacket;
use crate::proto::{
    CommonPesPacket, ProgramStreamDirectory, ProgramStreamMap, PsPackHeader, SystemHeader,
};
use crate::types::{
    is_av_pes_code, is_common_pes_code, PsStreamType, PES_SID_AUDIO, PES_SID_VIDEO, PS_CODE_END,
    PS_CODE_PACK, PS_CODE_PSD, PS_CODE_PSM, PS_CODE_SYSTEM,
};
use crate::BitReader;

/// 一帧已聚合完毕的媒体数据。时间戳已从 90kHz 折算成毫秒。
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
    pub stream_type: PsStreamType,
    pub pts: u64,
    pub dts: u64,
}

struct PsStream {
    sid: u8,
    cid: PsStreamType,
    pts: u64,
    dts: u64,
    buf: Vec<u8>,
}

impl PsStream {
    fn new(sid: u8, cid: PsStreamType) -> Self {
        PsStream { sid, cid, pts: 0, dts: 0, buf: Vec::with_capacity(4096) }
    }
}

/// 编码识别缓冲超过该值仍认不出来就推倒重来，防止坏流无限囤积。
const VERIFY_BUF_MAX: usize = 256;

#[derive(Default)]
pub struct PsDemuxer {
    streams: HashMap<u8, PsStream>,
    pack: PsPackHeader,
    system: SystemHeader,
    psm: ProgramStreamMap,
    psd: ProgramStreamDirectory,
    common_pes: CommonPesPacket,
    pes: PesPacket,
    mpeg1: bool,
    seen_pack: bool,
    cache: Vec<u8>,
    verify_buf: Vec<u8>,
    frames: VecDeque<Frame>,
}

impl PsDemuxer {
    pub fn new() -> Self {
        PsDemuxer::default()
    }

    /// 取走一帧。队列空返回 `None`。
    pub fn poll_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// 喂入一段 PS 数据。返回 [`PsError::NeedMore`] 表示尾部是半包、
    /// 已缓存，等下一段即可；其余错误为码流损坏。
    pub fn input(&mut self, data: &[u8]) -> Result<()> {
        let buf: Vec<u8> = if self.cache.is_empty() {
            data.to_vec()
        } else {
            let mut merged = std::mem::take(&mut self.cache);
            merged.extend_from_slice(data);
            merged
        };
        let mut bs = BitReader::new(&buf);
        let ret = self.run(&mut bs);
        match &ret {
            Ok(()) => self.cache.clear(),
            Err(e) if e.is_need_more() => {
                self.cache = bs.remaining().to_vec();
            }
            Err(_) => {
                // 结构损坏：丢掉缓存，下一段数据从新的起始码重新同步。
                self.cache.clear();
            }
        }
        ret
    }

    fn run(&mut self, bs: &mut BitReader) -> Result<()> {
        while !bs.eos() {
            if bs.remain_bits() < 32 {
                return Err(PsError::NeedMore);
            }
            let Some(prefix) = bs.next_bits(32) else {
                return Err(PsError::NeedMore);
            };
            let prefix = prefix as u32;
            match prefix {
                PS_CODE_PACK => {
                    self.pack.decode(bs)?;
                    self.mpeg1 = self.pack.is_mpeg1;
                    self.seen_pack = true;
                }
                PS_CODE_SYSTEM => {
                    if !self.seen_pack {
                        return Err(PsError::Parser("system header before pack header"));
                    }
                    self.system.decode(bs)?;
                }
                PS_CODE_PSM => {
                    self.psm.decode(bs)?;
                    for elem in &self.psm.stream_map {
                        let cid = PsStreamType::from_stream_type(elem.stream_type);
                        self.streams
                            .entry(elem.elementary_stream_id)
                            .and_modify(|s| s.cid = cid)
                            .or_insert_with(|| {
                                PsStream::new(elem.elementary_stream_id, cid)
                            });
                    }
                }
                PS_CODE_PSD => {
                    self.psd.decode(bs)?;
                }
                PS_CODE_END => {
                    bs.skip_bits(32);
                }
                _ if is_common_pes_code(prefix) => {
                    self.common_pes.decode(bs)?;
                }
                _ if is_av_pes_code(prefix) => {
                    if self.mpeg1 {
                        self.pes.decode_mpeg1(bs)?;
                    } else {
                        self.pes.decode(bs)?;
                    }
                    self.dispatch_pes();
                }
                _ => {
                    // 起始码间的杂音，逐字节重同步。
                    bs.skip_bits(8);
                }
            }
        }
        Ok(())
    }

    fn dispatch_pes(&mut self) {
        let sid = self.pes.stream_id;
        if let Some(stream) = self.streams.get_mut(&sid) {
            if self.mpeg1 && stream.cid == PsStreamType::Unknown {
                guess_codec(stream, &self.pes);
            }
            demux_pes(stream, &self.pes, &mut self.frames);
            return;
        }
        // PSM 没来（或者根本不会来），照流 id 补建。
        if self.mpeg1 {
            let mut stream = PsStream::new(sid, PsStreamType::Unknown);
            stream.buf.extend_from_slice(&self.pes.payload);
            stream.pts = self.pes.pts;
            stream.dts = self.pes.dts;
            self.streams.insert(sid, stream);
        } else if sid == PES_SID_VIDEO {
            if self.verify_buf.len() > VERIFY_BUF_MAX {
                self.verify_buf.clear();
            }
            self.verify_buf.extend_from_slice(&self.pes.payload);
            match detect_codec(&self.verify_buf) {
                VideoCodec::Unknown => {}
                VideoCodec::H264 => {
                    debug!(target: "mpegps::demuxer", "video stream identified as h264 without psm");
                    self.adopt_video(PsStreamType::H264);
                }
                VideoCodec::H265 => {
                    debug!(target: "mpegps::demuxer", "video stream identified as h265 without psm");
                    self.adopt_video(PsStreamType::H265);
                }
            }
        } else if sid == PES_SID_AUDIO && self.streams.contains_key(&PES_SID_VIDEO) {
            let cid = detect_audio(&self.pes.payload);
            let stream = self
                .streams
                .entry(PES_SID_AUDIO)
                .or_insert_with(|| PsStream::new(PES_SID_AUDIO, cid));
            demux_pes(stream, &self.pes, &mut self.frames);
        }
    }

    fn adopt_video(&mut self, cid: PsStreamType) {
        self.verify_buf.clear();
        let stream = self
            .streams
            .entry(PES_SID_VIDEO)
            .or_insert_with(|| PsStream::new(PES_SID_VIDEO, cid));
        demux_pes(stream, &self.pes, &mut self.frames);
    }

    /// 把各流里攒着的最后一帧吐出来。断流或 BYE 之后调用。
    pub fn flush(&mut self) {
        for stream in self.streams.values_mut() {
            if stream.buf.is_empty() {
                continue;
            }
            self.frames.push_back(Frame {
                payload: Bytes::copy_from_slice(&stream.buf),
                stream_type: stream.cid,
                pts: stream.pts / 90,
                dts: stream.dts / 90,
            });
            stream.buf.clear();
        }
    }
}

fn guess_codec(stream: &mut PsStream, pes: &PesPacket) {
    if stream.sid & 0xE0 == PES_SID_AUDIO {
        stream.cid = detect_audio(&pes.payload);
    } else if stream.sid & 0xE0 == PES_SID_VIDEO {
        match detect_codec(&stream.buf) {
            VideoCodec::Unknown => {}
            VideoCodec::H264 => stream.cid = PsStreamType::H264,
            VideoCodec::H265 => stream.cid = PsStreamType::H265,
        }
    }
}

/// ADTS 同步字打头按 AAC 算，否则按国标最常见的 G.711A。
fn detect_audio(payload: &[u8]) -> PsStreamType {
    if payload.len() >= 7 && payload[0] == 0xFF && payload[1] & 0xF0 == 0xF0 {
        PsStreamType::Aac
    } else {
        PsStreamType::G711A
    }
}

fn demux_pes(stream: &mut PsStream, pes: &PesPacket, out: &mut VecDeque<Frame>) {
    match stream.cid {
        PsStreamType::Aac | PsStreamType::G711A | PsStreamType::G711U => {
            out.push_back(Frame {
                payload: Bytes::copy_from_slice(&pes.payload),
                stream_type: stream.cid,
                pts: pes.pts / 90,
                dts: pes.dts / 90,
            });
        }
        PsStreamType::H264 | PsStreamType::H265 => demux_h26x(stream, pes, out),
        PsStreamType::Unknown => {
            if stream.pts != pes.pts {
                stream.buf.clear();
            }
            stream.buf.extend_from_slice(&pes.payload);
            stream.pts = pes.pts;
            stream.dts = pes.dts;
        }
    }
}

/// 视频按 PTS 聚合：同 PTS 的 PES 续在一起，PTS 变了先把上一个访问
/// 单元按 NAL 拆开吐出（丢弃分隔符 AUD），再开始攒新的。
fn demux_h26x(stream: &mut PsStream, pes: &PesPacket, out: &mut VecDeque<Frame>) {
    if stream.pts == 0 {
        stream.buf.extend_from_slice(&pes.payload);
        stream.pts = pes.pts;
        stream.dts = pes.dts;
    } else if stream.pts == pes.pts || pes.pts == 0 {
        stream.buf.extend_from_slice(&pes.payload);
    } else {
        let mut cursor = h26x::find_start_code(&stream.buf, 0);
        while let Some((start, sc)) = cursor {
            let (end, next) = match h26x::find_start_code(&stream.buf, start + sc) {
                Some((next_start, next_sc)) => (next_start, Some((next_start, next_sc))),
                None => (stream.buf.len(), None),
            };
            let is_aud = match stream.cid {
                PsStreamType::H264 => {
                    h26x::h264_nalu_type_at(&stream.buf[start..]) == H264_NALU_AUD
                }
                _ => h26x::h265_nalu_type_at(&stream.buf[start..]) == H265_NALU_AUD,
            };
            if !is_aud {
                out.push_back(Frame {
                    payload: Bytes::copy_from_slice(&stream.buf[start..end]),
                    stream_type: stream.cid,
                    pts: stream.pts / 90,
                    dts: stream.dts / 90,
                });
            }
            cursor = next;
        }
        stream.buf.clear();
        stream.buf.extend_from_slice(&pes.payload);
        stream.pts = pes.pts;
        stream.dts = pes.dts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitWriter;

    // 只有起始码，剩余不足一个最小 pack 头。
    const PS_TRUNCATED_PACK: &[u8] = &[0x00, 0x00, 0x01, 0xBA];
    // 完整的 MPEG-2 pack 头（含 1 字节填充）。
    const PS_PACK_MPEG2: &[u8] = &[
        0x00, 0x00, 0x01, 0xBA, 0x40, 0x01, 0x00, 0x01, 0x33, 0x44, 0xFF, 0xFF, 0xFF, 0xF1, 0xFF,
    ];
    // pack 头之后 system header 被截断。
    const PS_TRUNCATED_SYSTEM: &[u8] = &[
        0x00, 0x00, 0x01, 0xBA, 0x40, 0x01, 0x00, 0x01, 0x33, 0x44, 0xFF, 0xFF, 0xFF, 0xF0, 0x00,
        0x00, 0x01, 0xBB,
    ];
    // system header 声明的长度比固定部分还短。
    const PS_BAD_SYSTEM_LEN: &[u8] = &[
        0x00, 0x00, 0x01, 0xBA, 0x40, 0x01, 0x00, 0x01, 0x33, 0x44, 0xFF, 0xFF, 0xFF, 0xF1, 0x34,
        0x00, 0x00, 0x01, 0xBB, 0x00, 0x01, 0x00, 0x01, 0x33, 0x44, 0xFF, 0x34,
    ];
    // pack + 带一路流的 system header。
    const PS_PACK_AND_SYSTEM: &[u8] = &[
        0x00, 0x00, 0x01, 0xBA, 0x40, 0x01, 0x00, 0x01, 0x33, 0x44, 0xFF, 0xFF, 0xFF, 0xF1, 0x34,
        0x00, 0x00, 0x01, 0xBB, 0x00, 0x09, 0x00, 0x01, 0x33, 0x44, 0xFF, 0x34, 0x81, 0x00, 0x00,
    ];
    // MPEG-1 pack 头。
    const PS_PACK_MPEG1: &[u8] = &[
        0x00, 0x00, 0x01, 0xBA, 0x20, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03,
    ];

    #[test]
    fn truncated_pack_header_is_cached() {
        let mut demuxer = PsDemuxer::new();
        let err = demuxer.input(PS_TRUNCATED_PACK).unwrap_err();
        assert!(err.is_need_more());
        assert_eq!(demuxer.cache, PS_TRUNCATED_PACK);
    }

    #[test]
    fn complete_mpeg2_pack_header_parses() {
        let mut demuxer = PsDemuxer::new();
        demuxer.input(PS_PACK_MPEG2).unwrap();
        assert!(demuxer.cache.is_empty());
        assert!(!demuxer.mpeg1);
    }

    #[test]
    fn truncated_system_header_is_cached() {
        let mut demuxer = PsDemuxer::new();
        let err = demuxer.input(PS_TRUNCATED_SYSTEM).unwrap_err();
        assert!(err.is_need_more());
    }

    #[test]
    fn bogus_system_header_length_is_fatal() {
        let mut demuxer = PsDemuxer::new();
        let err = demuxer.input(PS_BAD_SYSTEM_LEN).unwrap_err();
        assert!(matches!(err, PsError::Parser(_)));
        assert!(demuxer.cache.is_empty());
    }

    #[test]
    fn pack_and_system_header_parse_together() {
        let mut demuxer = PsDemuxer::new();
        demuxer.input(PS_PACK_AND_SYSTEM).unwrap();
        assert_eq!(demuxer.system.streams.len(), 1);
        assert_eq!(demuxer.system.streams[0].stream_id, 0x81);
    }

    #[test]
    fn mpeg1_pack_header_switches_mode() {
        let mut demuxer = PsDemuxer::new();
        demuxer.input(PS_PACK_MPEG1).unwrap();
        assert!(demuxer.mpeg1);
    }

    #[test]
    fn psm_registers_streams() {
        let mut psm = ProgramStreamMap {
            current_next_indicator: 1,
            program_stream_map_version: 1,
            ..Default::default()
        };
        psm.stream_map.push(crate::ElementaryStreamElem::new(0x1B, 0xE0));
        psm.stream_map.push(crate::ElementaryStreamElem::new(0x90, 0xC0));
        let mut bsw = BitWriter::new(64);
        psm.encode(&mut bsw);

        let mut demuxer = PsDemuxer::new();
        demuxer.input(bsw.data()).unwrap();
        assert_eq!(demuxer.streams[&0xE0].cid, PsStreamType::H264);
        assert_eq!(demuxer.streams[&0xC0].cid, PsStreamType::G711A);
    }

    fn video_pes(pts: u64, payload: &[u8]) -> Vec<u8> {
        let pes = PesPacket {
            stream_id: 0xE0,
            pes_packet_length: (3 + 10 + payload.len()) as u16,
            pts_dts_flags: 0x03,
            pes_header_data_length: 10,
            pts,
            dts: pts,
            payload: payload.to_vec(),
            ..Default::default()
        };
        let mut bsw = BitWriter::new(64);
        pes.encode(&mut bsw);
        bsw.data().to_vec()
    }

    fn audio_pes(pts: u64, payload: &[u8]) -> Vec<u8> {
        let pes = PesPacket {
            stream_id: 0xC0,
            pes_packet_length: (3 + 5 + payload.len()) as u16,
            pts_dts_flags: 0x02,
            pes_header_data_length: 5,
            pts,
            payload: payload.to_vec(),
            ..Default::default()
        };
        let mut bsw = BitWriter::new(64);
        pes.encode(&mut bsw);
        bsw.data().to_vec()
    }

    fn h264_psm() -> Vec<u8> {
        let mut psm = ProgramStreamMap {
            current_next_indicator: 1,
            program_stream_map_version: 1,
            ..Default::default()
        };
        psm.stream_map.push(crate::ElementaryStreamElem::new(0x1B, 0xE0));
        psm.stream_map.push(crate::ElementaryStreamElem::new(0x90, 0xC0));
        let mut bsw = BitWriter::new(64);
        psm.encode(&mut bsw);
        bsw.data().to_vec()
    }

    #[test]
    fn video_frame_flushes_on_pts_change() {
        let idr = [0x00u8, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21];
        let slice = [0x00u8, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x02];

        let mut demuxer = PsDemuxer::new();
        demuxer.input(&h264_psm()).unwrap();
        demuxer.input(&video_pes(3600, &idr)).unwrap();
        assert!(demuxer.poll_frame().is_none());

        // PTS 变化触发上一帧出队。
        demuxer.input(&video_pes(7200, &slice)).unwrap();
        let frame = demuxer.poll_frame().unwrap();
        assert_eq!(frame.stream_type, PsStreamType::H264);
        assert_eq!(frame.pts, 40);
        assert_eq!(&frame.payload[..], &idr);
        assert!(demuxer.poll_frame().is_none());

        demuxer.flush();
        let tail = demuxer.poll_frame().unwrap();
        assert_eq!(&tail.payload[..], &slice);
        assert_eq!(tail.pts, 80);
    }

    #[test]
    fn same_pts_pes_fragments_are_joined() {
        let head = [0x00u8, 0x00, 0x00, 0x01, 0x65, 0x11, 0x22];
        let tail = [0x33u8, 0x44];
        let mut demuxer = PsDemuxer::new();
        demuxer.input(&h264_psm()).unwrap();
        demuxer.input(&video_pes(3600, &head)).unwrap();
        demuxer.input(&video_pes(3600, &tail)).unwrap();
        demuxer.input(&video_pes(7200, &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A])).unwrap();
        let frame = demuxer.poll_frame().unwrap();
        let mut want = head.to_vec();
        want.extend_from_slice(&tail);
        assert_eq!(&frame.payload[..], &want[..]);
    }

    #[test]
    fn aud_nalus_are_dropped_on_flush_boundary() {
        let mut buf = crate::h26x::H264_AUD_NALU.to_vec();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]);
        let mut demuxer = PsDemuxer::new();
        demuxer.input(&h264_psm()).unwrap();
        demuxer.input(&video_pes(3600, &buf)).unwrap();
        demuxer.input(&video_pes(7200, &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A])).unwrap();
        let frame = demuxer.poll_frame().unwrap();
        assert_eq!(&frame.payload[..], &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]);
        assert!(demuxer.poll_frame().is_none());
    }

    #[test]
    fn audio_frames_pass_straight_through() {
        let mut demuxer = PsDemuxer::new();
        demuxer.input(&h264_psm()).unwrap();
        demuxer.input(&audio_pes(90_000, &[0xD5; 160])).unwrap();
        let frame = demuxer.poll_frame().unwrap();
        assert_eq!(frame.stream_type, PsStreamType::G711A);
        assert_eq!(frame.pts, 1000);
        assert_eq!(frame.payload.len(), 160);
    }

    #[test]
    fn video_without_psm_is_identified_by_scoring() {
        let annexb = [
            0x00u8, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x01, 0x68, 0xCE,
            0x38, 0x80, 0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00,
        ];
        let mut demuxer = PsDemuxer::new();
        demuxer.input(&video_pes(3600, &annexb)).unwrap();
        assert_eq!(demuxer.streams[&0xE0].cid, PsStreamType::H264);
        // 后续 PES 正常聚合。
        demuxer.input(&video_pes(7200, &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A])).unwrap();
        let frames: Vec<Frame> = std::iter::from_fn(|| demuxer.poll_frame()).collect();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn audio_without_video_stream_is_ignored() {
        let mut demuxer = PsDemuxer::new();
        demuxer.input(&audio_pes(3600, &[0xD5; 20])).unwrap();
        assert!(demuxer.poll_frame().is_none());
        assert!(demuxer.streams.is_empty());
    }

    #[test]
    fn chunked_input_matches_whole_input() {
        let idr = [0x00u8, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21, 0x33, 0x44];
        let mut whole = h264_psm();
        whole.extend_from_slice(&video_pes(3600, &idr));
        whole.extend_from_slice(&video_pes(7200, &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A]));

        let mut reference = PsDemuxer::new();
        reference.input(&whole).unwrap();
        let want: Vec<Frame> = std::iter::from_fn(|| reference.poll_frame()).collect();

        let mut chunked = PsDemuxer::new();
        for chunk in whole.chunks(7) {
            match chunked.input(chunk) {
                Ok(()) => {}
                Err(e) => assert!(e.is_need_more()),
            }
        }
        let got: Vec<Frame> = std::iter::from_fn(|| chunked.poll_frame()).collect();
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(&want) {
            assert_eq!(g.payload, w.payload);
            assert_eq!(g.pts, w.pts);
            assert_eq!(g.stream_type, w.stream_type);
        }
    }
}
