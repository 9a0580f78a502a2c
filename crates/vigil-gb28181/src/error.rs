use thiserror::Error;

#[derive(Debug, Error)]
pub enum GbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sip parse error: {0}")]
    Sip(String),

    #[error("manscdp xml error: {0}")]
    Xml(String),

    #[error("device {0} not registered")]
    DeviceNotFound(String),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("media port range exhausted")]
    PortExhausted,

    #[error("channel {0} already has an invite in flight")]
    InviteInProgress(String),

    #[error("ssrc {0} does not match any channel")]
    InvalidSsrc(u32),

    #[error("media error: {0}")]
    Media(String),

    #[error("request timed out waiting for response")]
    Timeout,

    #[error("invite rejected with status {0}")]
    InviteRejected(u16),
}

pub type Result<T> = std::result::Result<T, GbError>;
