//! File-based known-hosts matcher (§4.C), grounded on `cockpitknownhosts.c`.
//!
//! Unlike the teacher's DB-backed `KnownHosts` (which persisted accepted
//! keys in warpgate's own database), this one reads the OpenSSH-dialect
//! file format directly: plain glob-pattern hostname lists or HMAC-SHA1
//! hashed entries, no database involved.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Checks whether `host:port` (or bare `host`) appears in the known-hosts
/// file at `path`. Returns `Ok(false)` on a missing file (not an error: the
/// caller treats an absent file the same as an empty one).
pub fn contains_host(path: &std::path::Path, host: &str, port: u16) -> std::io::Result<bool> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    Ok(matches_known_hosts(&contents, host, port))
}

/// Outcome of a key-aware known-hosts lookup (§4.D "Key found but changed").
///
/// Plain [`contains_host`]/[`matches_known_hosts`] only ever answer
/// "is this hostname listed", which can't distinguish a host that was never
/// seen before from one whose stored key no longer matches what the server
/// just presented — both look like "no match" to a hostname-only check.
/// This compares the type + base64 key fields too, so a same-hostname,
/// different-key line is reported distinctly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match {
    /// No line's hostname field matched `host`/`[host]:port` at all.
    NotFound,
    /// A line matched the hostname and carried exactly this key.
    Found,
    /// A line matched the hostname but carried a different key.
    Mismatched,
}

/// Key-aware counterpart to [`contains_host`]; see [`Match`].
pub fn lookup_key(
    path: &std::path::Path,
    host: &str,
    port: u16,
    key_type: &str,
    key_base64: &str,
) -> std::io::Result<Match> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Match::NotFound),
        Err(err) => return Err(err),
    };
    Ok(lookup_key_in(&contents, host, port, key_type, key_base64))
}

pub fn lookup_key_in(contents: &str, host: &str, port: u16, key_type: &str, key_base64: &str) -> Match {
    let hostport = format!("[{host}]:{port}");
    let mut mismatched = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.splitn(4, ' ');
        let Some(hosts_field) = tokens.next() else {
            continue;
        };
        let rest: Vec<&str> = tokens.collect();
        if !(2..=3).contains(&rest.len()) {
            continue;
        }
        if !(matches_candidate(hosts_field, &hostport) || matches_candidate(hosts_field, host)) {
            continue;
        }
        if rest[0] == key_type && rest[1] == key_base64 {
            return Match::Found;
        }
        mismatched = true;
    }
    if mismatched {
        Match::Mismatched
    } else {
        Match::NotFound
    }
}

pub fn matches_known_hosts(contents: &str, host: &str, port: u16) -> bool {
    let hostport = format!("[{host}]:{port}");
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split(' ');
        let Some(hosts_field) = tokens.next() else {
            continue;
        };
        let token_count = 1 + tokens.count();
        if !(3..=4).contains(&token_count) {
            continue;
        }
        if matches_candidate(hosts_field, &hostport) || matches_candidate(hosts_field, host) {
            return true;
        }
    }
    false
}

fn matches_candidate(token: &str, candidate: &str) -> bool {
    if let Some(rest) = token.strip_prefix("|1|") {
        return matches_hashed(rest, candidate);
    }
    matches_pattern_list(token, candidate)
}

fn matches_hashed(rest: &str, candidate: &str) -> bool {
    let Some((salt_b64, hash_b64)) = rest.split_once('|') else {
        return false;
    };
    let engine = base64::engine::general_purpose::STANDARD;
    let Ok(salt) = engine.decode(salt_b64) else {
        return false;
    };
    let Ok(hash) = engine.decode(hash_b64) else {
        return false;
    };
    if hash.len() != 20 {
        return false;
    }
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(candidate.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

fn matches_pattern_list(token: &str, candidate: &str) -> bool {
    let mut matched = false;
    for sub in token.split(',') {
        let (negate, pattern) = match sub.strip_prefix('!') {
            Some(p) => (true, p),
            None => (false, sub),
        };
        if glob_match(pattern, candidate) {
            if negate {
                return false;
            }
            matched = true;
        }
    }
    matched
}

/// `?`/`*` glob matching, case-insensitive.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let text: Vec<char> = text.to_ascii_lowercase().chars().collect();
    glob_match_rec(&pattern, &text)
}

fn glob_match_rec(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_rec(&pattern[1..], text)
                || (!text.is_empty() && glob_match_rec(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && glob_match_rec(&pattern[1..], &text[1..]),
        Some(c) => {
            !text.is_empty() && *c == text[0] && glob_match_rec(&pattern[1..], &text[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_hostname_matches() {
        assert!(matches_known_hosts(
            "example.com ssh-ed25519 AAAA...\n",
            "example.com",
            22
        ));
    }

    #[test]
    fn hostport_form_matches() {
        assert!(matches_known_hosts(
            "[example.com]:2222 ssh-ed25519 AAAA...\n",
            "example.com",
            2222
        ));
    }

    #[test]
    fn glob_pattern_matches() {
        assert!(matches_known_hosts(
            "*.example.com ssh-ed25519 AAAA...\n",
            "host.example.com",
            22
        ));
    }

    #[test]
    fn negation_short_circuits() {
        assert!(!matches_known_hosts(
            "*.example.com,!bad.example.com ssh-ed25519 AAAA...\n",
            "bad.example.com",
            22
        ));
    }

    #[test]
    fn comment_and_blank_lines_skipped() {
        assert!(!matches_known_hosts("# comment\n\n", "example.com", 22));
    }

    #[test]
    fn hashed_entry_matches() {
        let salt = b"0123456789abcdef0123".to_vec();
        let mut mac = HmacSha1::new_from_slice(&salt).unwrap();
        mac.update(b"example.com");
        let hash = mac.finalize().into_bytes();
        let engine = base64::engine::general_purpose::STANDARD;
        let line = format!(
            "|1|{}|{} ssh-ed25519 AAAA...\n",
            engine.encode(&salt),
            engine.encode(hash)
        );
        assert!(matches_known_hosts(&line, "example.com", 22));
    }

    #[test]
    fn wrong_token_count_is_ignored() {
        assert!(!matches_known_hosts("example.com onlytwo\n", "example.com", 22));
    }

    #[test]
    fn lookup_key_finds_exact_match() {
        let verdict = lookup_key_in(
            "example.com ssh-ed25519 AAAA...\n",
            "example.com",
            22,
            "ssh-ed25519",
            "AAAA...",
        );
        assert_eq!(verdict, Match::Found);
    }

    #[test]
    fn lookup_key_reports_changed_key_distinctly_from_unknown() {
        let verdict = lookup_key_in(
            "example.com ssh-ed25519 AAAA_OLD\n",
            "example.com",
            22,
            "ssh-ed25519",
            "AAAA_NEW",
        );
        assert_eq!(verdict, Match::Mismatched);

        let verdict = lookup_key_in("", "example.com", 22, "ssh-ed25519", "AAAA_NEW");
        assert_eq!(verdict, Match::NotFound);
    }

    #[test]
    fn lookup_key_ignores_unrelated_hosts() {
        let verdict = lookup_key_in(
            "other.example.com ssh-ed25519 AAAA_OLD\n",
            "example.com",
            22,
            "ssh-ed25519",
            "AAAA_NEW",
        );
        assert_eq!(verdict, Match::NotFound);
    }
}
