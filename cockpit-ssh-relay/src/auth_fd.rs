//! The auth-FD JSON conversation (§4.B).
//!
//! A `SOCK_SEQPACKET` descriptor carries one JSON object per datagram, no
//! length framing (the socket itself preserves message boundaries).

use std::collections::HashMap;

use cockpit_ssh_common::{AuthMethodResult, CommonError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prompt {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub echo: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "host-key")]
    pub host_key: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "host-fingerprint"
    )]
    pub host_fingerprint: Option<String>,
    #[serde(default, rename = "auth-method-results")]
    pub auth_method_results: HashMap<String, AuthMethodResult>,
}

/// Strips the terminating NUL bytes a peer's raw datagram reply may carry.
pub fn trim_reply(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && raw[end - 1] == 0 {
        end -= 1;
    }
    &raw[..end]
}

pub fn encode_prompt(prompt: &Prompt) -> Result<Vec<u8>, CommonError> {
    serde_json::to_vec(prompt).map_err(CommonError::other)
}

pub fn encode_verdict(verdict: &Verdict) -> Result<Vec<u8>, CommonError> {
    serde_json::to_vec(verdict).map_err(CommonError::other)
}

pub fn decode_reply(raw: &[u8]) -> String {
    String::from_utf8_lossy(trim_reply(raw)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_nuls_only() {
        assert_eq!(trim_reply(b"hello\0\0\0"), b"hello");
        assert_eq!(trim_reply(b"hel\0lo"), b"hel\0lo");
    }

    #[test]
    fn verdict_omits_absent_fields() {
        let verdict = Verdict {
            user: Some("admin".to_owned()),
            ..Default::default()
        };
        let encoded = encode_verdict(&verdict).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("\"user\":\"admin\""));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn prompt_serializes_expected_shape() {
        let prompt = Prompt {
            prompt: "Password".to_owned(),
            message: None,
            default: None,
            echo: false,
        };
        let encoded = String::from_utf8(encode_prompt(&prompt).unwrap()).unwrap();
        assert!(encoded.contains("\"prompt\":\"Password\""));
        assert!(encoded.contains("\"echo\":false"));
    }
}
