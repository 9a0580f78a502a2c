//! Annex-B 码流辅助：起始码扫描、NAL 类型提取，以及给未携带 PSM 的
//! 流猜编码用的打分器。国标设备相当一部分从不发 PSM，只能看裸流。

/// ffmpeg mpegtsenc.c 中的分隔符 NAL，复用端补帧边界用。
pub const H264_AUD_NALU: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
pub const H265_AUD_NALU: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x46, 0x01, 0x50];

pub const H264_NALU_SLICE: u8 = 1;
pub const H264_NALU_IDR: u8 = 5;
pub const H264_NALU_SEI: u8 = 6;
pub const H264_NALU_SPS: u8 = 7;
pub const H264_NALU_PPS: u8 = 8;
pub const H264_NALU_AUD: u8 = 9;

pub const H265_NALU_IDR_W_RADL: u8 = 19;
pub const H265_NALU_IDR_N_LP: u8 = 20;
pub const H265_NALU_VPS: u8 = 32;
pub const H265_NALU_SPS: u8 = 33;
pub const H265_NALU_PPS: u8 = 34;
pub const H265_NALU_AUD: u8 = 35;

/// 打分器赢出门槛：必须拿到至少这么多分、且严格领先另一方。
pub const SCORE_WIN: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Unknown,
    H264,
    H265,
}

/// 从 `from` 起找下一个 Annex-B 起始码，返回（位置，起始码长度）。
pub fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// 逐个回调去掉起始码后的 NAL。回调返回 false 则提前终止。
pub fn split_frame<F>(frame: &[u8], mut f: F)
where
    F: FnMut(&[u8]) -> bool,
{
    let Some((mut start, mut sc)) = find_start_code(frame, 0) else {
        return;
    };
    loop {
        let body = start + sc;
        let end = match find_start_code(frame, body) {
            Some((next, next_sc)) => {
                let e = next;
                start = next;
                sc = next_sc;
                e
            }
            None => frame.len(),
        };
        if body < end && !f(&frame[body..end]) {
            return;
        }
        if end == frame.len() {
            return;
        }
    }
}

pub fn h264_nalu_type(b: u8) -> u8 {
    b & 0x1F
}

pub fn h265_nalu_type(b: u8) -> u8 {
    (b >> 1) & 0x3F
}

/// `nalu` 以起始码开头时取其 NAL 类型（H.264）。
pub fn h264_nalu_type_at(nalu: &[u8]) -> u8 {
    match find_start_code(nalu, 0) {
        Some((pos, sc)) if nalu.len() > pos + sc => h264_nalu_type(nalu[pos + sc]),
        _ => 0,
    }
}

pub fn h265_nalu_type_at(nalu: &[u8]) -> u8 {
    match find_start_code(nalu, 0) {
        Some((pos, sc)) if nalu.len() > pos + sc => h265_nalu_type(nalu[pos + sc]),
        _ => 0,
    }
}

fn h264_nalu_score(t: u8) -> i32 {
    match t {
        H264_NALU_IDR | H264_NALU_SPS | H264_NALU_PPS => 2,
        H264_NALU_SLICE => 1,
        2..=4 | H264_NALU_SEI | 9..=12 => 0,
        _ => -1,
    }
}

fn h265_nalu_score(t: u8) -> i32 {
    match t {
        H265_NALU_IDR_W_RADL | H265_NALU_IDR_N_LP | H265_NALU_VPS | H265_NALU_SPS
        | H265_NALU_PPS => 2,
        0..=9 => 1,
        16..=18 | 21 | H265_NALU_AUD | 39 | 40 => 0,
        _ => -1,
    }
}

/// 对累计的裸流按两种语义各打一遍分。参数集和 IDR 权重最高，
/// 常规片次之，语义下不可能出现的类型扣分；达到 [`SCORE_WIN`]
/// 且严格领先的一方胜出，否则继续等数据。
pub fn detect_codec(buf: &[u8]) -> VideoCodec {
    let mut score_h264 = 0i32;
    let mut score_h265 = 0i32;
    split_frame(buf, |nalu| {
        let head = nalu[0];
        if head & 0x80 != 0 {
            // forbidden_zero_bit 置位，两边都不像。
            score_h264 -= 1;
            score_h265 -= 1;
            return true;
        }
        score_h264 += h264_nalu_score(h264_nalu_type(head));
        score_h265 += h265_nalu_score(h265_nalu_type(head));
        true
    });
    if score_h264 >= SCORE_WIN && score_h264 > score_h265 {
        VideoCodec::H264
    } else if score_h265 >= SCORE_WIN && score_h265 > score_h264 {
        VideoCodec::H265
    } else {
        VideoCodec::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_three_and_four_byte_start_codes() {
        let buf = [0xAA, 0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x00, 0x01, 0x68];
        assert_eq!(find_start_code(&buf, 0), Some((1, 3)));
        assert_eq!(find_start_code(&buf, 4), Some((5, 4)));
        assert_eq!(find_start_code(&buf, 6), None);
    }

    #[test]
    fn split_frame_strips_start_codes() {
        let buf = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x00, 0x00, 0x01,
            0x65, 0x88,
        ];
        let mut nalus = Vec::new();
        split_frame(&buf, |nalu| {
            nalus.push(nalu.to_vec());
            true
        });
        assert_eq!(nalus.len(), 3);
        assert_eq!(nalus[0], vec![0x67, 0x42]);
        assert_eq!(nalus[1], vec![0x68, 0xCE]);
        assert_eq!(nalus[2], vec![0x65, 0x88]);
    }

    #[test]
    fn detects_h264_from_parameter_sets() {
        // SPS + PPS + IDR。
        let buf = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x01, 0x68, 0xCE,
            0x38, 0x80, 0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00,
        ];
        assert_eq!(detect_codec(&buf), VideoCodec::H264);
    }

    #[test]
    fn detects_h265_from_parameter_sets() {
        // VPS + SPS + PPS + IDR_W_RADL。
        let buf = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0x01,
            0x00, 0x00, 0x00, 0x01, 0x44, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0x26, 0x01, 0xAF,
        ];
        assert_eq!(detect_codec(&buf), VideoCodec::H265);
    }

    #[test]
    fn single_ambiguous_nalu_stays_unknown() {
        let buf = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A];
        assert_eq!(detect_codec(&buf), VideoCodec::Unknown);
    }
}
