/// PS 流里出现的负载编码（取值与 PSM stream_type 一致）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PsStreamType {
    Aac,
    H264,
    H265,
    G711A,
    G711U,
    Unknown,
}

impl PsStreamType {
    pub fn from_stream_type(v: u8) -> Self {
        match v {
            0x0F => PsStreamType::Aac,
            0x1B => PsStreamType::H264,
            0x24 => PsStreamType::H265,
            0x90 => PsStreamType::G711A,
            0x91 => PsStreamType::G711U,
            _ => PsStreamType::Unknown,
        }
    }

    pub fn as_stream_type(self) -> u8 {
        match self {
            PsStreamType::Aac => 0x0F,
            PsStreamType::H264 => 0x1B,
            PsStreamType::H265 => 0x24,
            PsStreamType::G711A => 0x90,
            PsStreamType::G711U => 0x91,
            PsStreamType::Unknown => 0xFF,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, PsStreamType::H264 | PsStreamType::H265)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, PsStreamType::Aac | PsStreamType::G711A | PsStreamType::G711U)
    }
}

// pack 层起始码。
pub const PS_CODE_PACK: u32 = 0x0000_01BA;
pub const PS_CODE_SYSTEM: u32 = 0x0000_01BB;
pub const PS_CODE_PSM: u32 = 0x0000_01BC;
pub const PS_CODE_PSD: u32 = 0x0000_01FF;
pub const PS_CODE_END: u32 = 0x0000_01B9;

// PES stream_id。音频 0xC0..=0xDF，视频 0xE0..=0xFF。
pub const PES_SID_PRIVATE: u8 = 0xBD;
pub const PES_SID_AUDIO: u8 = 0xC0;
pub const PES_SID_VIDEO: u8 = 0xE0;

/// stream_id 是否落在音/视频 PES 区间。
pub(crate) fn is_av_pes_code(prefix: u32) -> bool {
    prefix & 0xFFFF_FFE0 == 0x0000_01C0 || prefix & 0xFFFF_FFE0 == 0x0000_01E0
}

/// 私有流、padding、ECM/EMM 等一律按通用 PES 跳过。
pub(crate) fn is_common_pes_code(prefix: u32) -> bool {
    matches!(prefix, 0x0000_01BD..=0x0000_01BF | 0x0000_01F0..=0x0000_01FB)
}
