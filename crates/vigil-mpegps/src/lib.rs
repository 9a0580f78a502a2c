//! MPEG-PS（节目流）解复用/复用。
//!
//! GB28181 的媒体通道以 RTP 承载 PS 流，本 crate 负责把 PS 包还原成
//! H.264/H.265/G.711/AAC 帧，以及反向把帧打包回 PS。解码过程不做任何 I/O，
//! 输入不完整时以 [`PsError::NeedMore`] 标记，由调用方续喂数据。

mod bits;
mod demuxer;
mod error;
pub mod h26x;
mod muxer;
mod pes;
mod proto;
mod types;

pub use bits::{BitReader, BitWriter};
pub use demuxer::{Frame, PsDemuxer};
pub use error::{PsError, Result};
pub use muxer::{PsMuxer, PsPacketChunk};
pub use pes::PesPacket;
pub use proto::{
    CommonPesPacket, ElementaryStream, ElementaryStreamElem, ProgramStreamDirectory,
    ProgramStreamMap, PsPackHeader, SystemHeader,
};
pub use types::{
    PsStreamType, PES_SID_AUDIO, PES_SID_PRIVATE, PES_SID_VIDEO, PS_CODE_END, PS_CODE_PACK,
    PS_CODE_PSD, PS_CODE_PSM, PS_CODE_SYSTEM,
};
