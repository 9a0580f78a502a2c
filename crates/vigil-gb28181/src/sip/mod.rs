//! SIP 信令子系统：报文编解码、Digest 鉴权、SDP、信令服务。

pub mod auth;
pub mod message;
pub mod sdp;
pub mod server;

use rand::Rng;

/// 生成 n 位十进制随机串，用作 tag / Call-ID / nonce 片段。
pub(crate) fn rand_digits(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

/// 生成 Via branch，按 RFC 3261 必须带 z9hG4bK 前缀。
pub(crate) fn rand_branch() -> String {
    format!("z9hG4bK{}", rand_digits(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_digits_length_and_charset() {
        let s = rand_digits(10);
        assert_eq!(s.len(), 10);
        assert!(s.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn branch_has_magic_cookie() {
        assert!(rand_branch().starts_with("z9hG4bK"));
    }
}
