//! REGISTER 的 Digest 鉴权。
//!
//! 只支持 MD5 算法，qop 留空，和主流国标设备的实现对齐。

use std::collections::HashMap;

/// 解析 Authorization 头里的 Digest 参数表。
pub fn parse_authorization(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.trim().strip_prefix("Digest")?.trim();
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let (k, v) = part.split_once('=')?;
        params.insert(k.trim().to_ascii_lowercase(), v.trim().trim_matches('"').to_string());
    }
    Some(params)
}

/// 三段式 MD5：H(user:realm:pass)、H(method:uri)、H(r1:nonce:r2)。
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let r1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let r2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", r1, nonce, r2)))
}

/// 校验设备带上来的 Authorization。
/// username 必须是配置的用户名或设备自身编码，nonce 必须是本次挑战下发的值。
pub fn verify(
    params: &HashMap<String, String>,
    expect_users: &[&str],
    password: &str,
    realm: &str,
    nonce: &str,
) -> bool {
    let (Some(username), Some(uri), Some(response)) =
        (params.get("username"), params.get("uri"), params.get("response"))
    else {
        return false;
    };
    if !expect_users.contains(&username.as_str()) {
        return false;
    }
    if params.get("realm").map(String::as_str) != Some(realm) {
        return false;
    }
    if params.get("nonce").map(String::as_str) != Some(nonce) {
        return false;
    }
    let expected = digest_response(username, realm, password, "REGISTER", uri, nonce);
    expected.eq_ignore_ascii_case(response)
}

/// 401 挑战头。
pub fn www_authenticate(realm: &str, nonce: &str) -> String {
    format!("Digest realm=\"{}\",algorithm=MD5,nonce=\"{}\"", realm, nonce)
}

/// 32 位十进制 nonce。
pub fn new_nonce() -> String {
    super::rand_digits(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge_and_answer() -> (HashMap<String, String>, String) {
        let nonce = new_nonce();
        let response = digest_response(
            "34020000001320000001",
            "3402000000",
            "12345678",
            "REGISTER",
            "sip:34020000002000000001@3402000000",
            &nonce,
        );
        let header = format!(
            "Digest username=\"34020000001320000001\", realm=\"3402000000\", \
             nonce=\"{}\", uri=\"sip:34020000002000000001@3402000000\", \
             response=\"{}\", algorithm=MD5",
            nonce, response
        );
        (parse_authorization(&header).unwrap(), nonce)
    }

    #[test]
    fn valid_digest_passes() {
        let (params, nonce) = challenge_and_answer();
        assert!(verify(
            &params,
            &["34020000001320000001"],
            "12345678",
            "3402000000",
            &nonce
        ));
    }

    #[test]
    fn wrong_password_fails() {
        let (params, nonce) = challenge_and_answer();
        assert!(!verify(&params, &["34020000001320000001"], "badpass", "3402000000", &nonce));
    }

    #[test]
    fn stale_nonce_fails() {
        let (params, _) = challenge_and_answer();
        assert!(!verify(
            &params,
            &["34020000001320000001"],
            "12345678",
            "3402000000",
            &new_nonce()
        ));
    }

    #[test]
    fn unexpected_username_fails() {
        let (params, nonce) = challenge_and_answer();
        assert!(!verify(&params, &["admin"], "12345678", "3402000000", &nonce));
    }

    #[test]
    fn challenge_header_shape() {
        let header = www_authenticate("3402000000", "123");
        assert_eq!(header, "Digest realm=\"3402000000\",algorithm=MD5,nonce=\"123\"");
        assert_eq!(new_nonce().len(), 32);
    }

    #[test]
    fn parse_rejects_non_digest() {
        assert!(parse_authorization("Basic dXNlcg==").is_none());
    }
}
