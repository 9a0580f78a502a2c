use thiserror::Error;

/// PS 解析/打包错误。
///
/// `NeedMore` 不是真正的失败：半包在 RTP 上很常见，调用方把剩余数据
/// 缓存后续喂即可。只有 `Parser` 表示码流本身损坏。
#[derive(Debug, Error)]
pub enum PsError {
    #[error("need more bytes")]
    NeedMore,

    #[error("malformed program stream: {0}")]
    Parser(&'static str),

    #[error("elementary stream id {0:#04x} not registered")]
    StreamIdNotFound(u8),
}

impl PsError {
    pub fn is_need_more(&self) -> bool {
        matches!(self, PsError::NeedMore)
    }
}

pub type Result<T> = std::result::Result<T, PsError>;
