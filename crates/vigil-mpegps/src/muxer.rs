//! PS 复用器。帧进、pack 出：每帧一个 pack 头，关键帧前重发
//! system header 和 PSM，超过 64KB 的访问单元按 PES 上限切片。

use std::collections::VecDeque;

use bytes::Bytes;

use crate::bits::BitWriter;
use crate::error::{PsError, Result};
use crate::h26x::{
    self, H264_AUD_NALU, H264_NALU_AUD, H264_NALU_IDR, H264_NALU_SLICE, H265_AUD_NALU,
    H265_NALU_AUD,
};
use crate::pes::PesPacket;
use crate::proto::{ElementaryStream, ElementaryStreamElem, ProgramStreamMap, PsPackHeader, SystemHeader};
use crate::types::{PsStreamType, PES_SID_AUDIO, PES_SID_VIDEO};

/// 一段编好的 PS 数据（一个 pack 内的单个 PES）。
#[derive(Debug, Clone)]
pub struct PsPacketChunk {
    pub data: Bytes,
    pub pts: u64,
}

pub struct PsMuxer {
    system: SystemHeader,
    psm: ProgramStreamMap,
    first_frame: bool,
    packets: VecDeque<PsPacketChunk>,
}

impl Default for PsMuxer {
    fn default() -> Self {
        PsMuxer::new()
    }
}

impl PsMuxer {
    pub fn new() -> Self {
        PsMuxer {
            system: SystemHeader { rate_bound: 26234, ..Default::default() },
            psm: ProgramStreamMap {
                current_next_indicator: 1,
                program_stream_map_version: 1,
                ..Default::default()
            },
            first_frame: true,
            packets: VecDeque::new(),
        }
    }

    /// 登记一路流，返回分配的 stream_id。
    pub fn add_stream(&mut self, cid: PsStreamType) -> u8 {
        let sid = if cid.is_video() {
            let mut es = ElementaryStream::new(PES_SID_VIDEO + self.system.video_bound);
            es.pstd_buffer_bound_scale = 1;
            es.pstd_buffer_size_bound = 400;
            let sid = es.stream_id;
            self.system.streams.push(es);
            self.system.video_bound += 1;
            sid
        } else {
            let mut es = ElementaryStream::new(PES_SID_AUDIO + self.system.audio_bound);
            es.pstd_buffer_bound_scale = 0;
            es.pstd_buffer_size_bound = 32;
            let sid = es.stream_id;
            self.system.streams.push(es);
            self.system.audio_bound += 1;
            sid
        };
        self.psm.stream_map.push(ElementaryStreamElem::new(cid.as_stream_type(), sid));
        self.psm.program_stream_map_version = self.psm.program_stream_map_version.wrapping_add(1);
        sid
    }

    pub fn poll_packet(&mut self) -> Option<PsPacketChunk> {
        self.packets.pop_front()
    }

    /// 写入一帧（Annex-B，pts/dts 毫秒）。
    pub fn write(&mut self, sid: u8, frame: &[u8], pts: u64, dts: u64) -> Result<()> {
        let stream_type = self
            .psm
            .stream_map
            .iter()
            .find(|es| es.elementary_stream_id == sid)
            .map(|es| es.stream_type)
            .ok_or(PsError::StreamIdNotFound(sid))?;
        if frame.is_empty() {
            return Ok(());
        }

        let mut with_aud = false;
        let mut idr = false;
        let mut vcl = false;
        if stream_type == PsStreamType::H264.as_stream_type() {
            h26x::split_frame(frame, |nalu| {
                match h26x::h264_nalu_type(nalu[0]) {
                    H264_NALU_AUD => {
                        with_aud = true;
                        false
                    }
                    t @ H264_NALU_SLICE..=H264_NALU_IDR => {
                        idr |= t == H264_NALU_IDR;
                        vcl = true;
                        false
                    }
                    _ => true,
                }
            });
        } else if stream_type == PsStreamType::H265.as_stream_type() {
            h26x::split_frame(frame, |nalu| {
                match h26x::h265_nalu_type(nalu[0]) {
                    H265_NALU_AUD => {
                        with_aud = true;
                        false
                    }
                    // BLA..RSV_IRAP 为关键帧区间，TRAIL..RASL 为普通片。
                    16..=23 => {
                        idr = true;
                        vcl = true;
                        false
                    }
                    0..=9 => {
                        vcl = true;
                        false
                    }
                    _ => true,
                }
            });
        }

        let pts = pts * 90;
        let dts = dts * 90;
        let mut bsw = BitWriter::new(1024);
        let pack = PsPackHeader {
            scr_base: dts.saturating_sub(3600),
            scr_ext: 0,
            program_mux_rate: 6106,
            ..Default::default()
        };
        pack.encode(&mut bsw);
        if self.first_frame || idr {
            self.system.encode(&mut bsw);
            self.psm.encode(&mut bsw);
            self.first_frame = false;
        }

        let mut rest = frame;
        let mut first = true;
        let mut pes = PesPacket {
            stream_id: sid,
            pts_dts_flags: 0x03,
            pes_header_data_length: 10,
            pts,
            dts,
            data_alignment_indicator: u8::from(idr),
            ..Default::default()
        };
        while !rest.is_empty() {
            let mut pes_header_len = 13usize;
            pes.payload.clear();
            if first && !with_aud && vcl {
                if stream_type == PsStreamType::H264.as_stream_type() {
                    pes.payload.extend_from_slice(&H264_AUD_NALU);
                    pes_header_len += H264_AUD_NALU.len();
                } else if stream_type == PsStreamType::H265.as_stream_type() {
                    pes.payload.extend_from_slice(&H265_AUD_NALU);
                    pes_header_len += H265_AUD_NALU.len();
                }
            }
            if pes_header_len + rest.len() >= 0xFFFF {
                pes.pes_packet_length = 0xFFFF;
                let take = 0xFFFF - pes_header_len;
                pes.payload.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
            } else {
                pes.pes_packet_length = (pes_header_len + rest.len()) as u16;
                pes.payload.extend_from_slice(rest);
                rest = &rest[rest.len()..];
            }
            pes.encode(&mut bsw);
            self.packets.push_back(PsPacketChunk {
                data: Bytes::copy_from_slice(bsw.data()),
                pts,
            });
            bsw.reset();
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxer::PsDemuxer;

    #[test]
    fn unknown_stream_id_is_rejected() {
        let mut muxer = PsMuxer::new();
        let err = muxer.write(0xE0, &[0, 0, 0, 1, 0x65], 0, 0).unwrap_err();
        assert!(matches!(err, PsError::StreamIdNotFound(0xE0)));
    }

    #[test]
    fn video_stream_ids_start_at_e0() {
        let mut muxer = PsMuxer::new();
        assert_eq!(muxer.add_stream(PsStreamType::H264), 0xE0);
        assert_eq!(muxer.add_stream(PsStreamType::G711A), 0xC0);
        assert_eq!(muxer.add_stream(PsStreamType::H265), 0xE1);
    }

    #[test]
    fn mux_then_demux_restores_video_frame() {
        let mut muxer = PsMuxer::new();
        let sid = muxer.add_stream(PsStreamType::H264);
        let idr = [
            0x00u8, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x01, 0x68, 0xCE,
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84,
        ];
        let slice = [0x00u8, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x22, 0x33];
        muxer.write(sid, &idr, 40, 40).unwrap();
        muxer.write(sid, &slice, 80, 80).unwrap();
        // 再垫一帧，把上面两帧都推过 PTS 边界。
        muxer.write(sid, &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9B], 120, 120).unwrap();

        let mut demuxer = PsDemuxer::new();
        while let Some(pkt) = muxer.poll_packet() {
            demuxer.input(&pkt.data).unwrap();
        }

        let frames: Vec<_> = std::iter::from_fn(|| demuxer.poll_frame()).collect();
        // 复用时补了 AUD，解复用在帧边界把它丢掉；两帧各自完整回来。
        let joined: Vec<u8> = frames
            .iter()
            .filter(|f| f.pts == 40)
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(&joined[..], &idr[..]);
        let second: Vec<u8> = frames
            .iter()
            .filter(|f| f.pts == 80)
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(&second[..], &slice[..]);
    }

    #[test]
    fn oversized_frame_splits_into_multiple_pes() {
        let mut muxer = PsMuxer::new();
        let sid = muxer.add_stream(PsStreamType::H264);
        let mut frame = vec![0x00, 0x00, 0x00, 0x01, 0x65];
        frame.resize(200_000, 0xAB);
        muxer.write(sid, &frame, 40, 40).unwrap();
        let mut packets = 0;
        let mut total_payload = 0usize;
        while let Some(pkt) = muxer.poll_packet() {
            packets += 1;
            assert!(!pkt.data.is_empty());
            total_payload += pkt.data.len();
        }
        assert!(packets >= 4);
        assert!(total_payload > frame.len());
    }

    #[test]
    fn audio_frames_do_not_resend_psm() {
        let mut muxer = PsMuxer::new();
        let vid = muxer.add_stream(PsStreamType::H264);
        let aud = muxer.add_stream(PsStreamType::G711A);
        muxer.write(vid, &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88], 0, 0).unwrap();
        let _ = muxer.poll_packet().unwrap();
        muxer.write(aud, &[0xD5; 160], 20, 20).unwrap();
        let pkt = muxer.poll_packet().unwrap();
        // pack 头 14 字节后应直接跟 PES，而不是 system/psm。
        assert_eq!(&pkt.data[14..18], &[0x00, 0x00, 0x01, 0xC0]);
    }
}
