use tracing::warn;

/// A parsed `[user@]host[:port]` target specifier (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

const DEFAULT_PORT: u16 = 22;

impl Target {
    /// Parses a target specifier.
    ///
    /// Tie-breaks: the rightmost `@` splits user from host (an empty user is
    /// ignored with a warning); the rightmost `:` whose tail is a decimal
    /// number in `(0, 65535]` splits host from port, otherwise the `:` is
    /// taken to be part of the host and the default port is used.
    pub fn parse(spec: &str) -> Self {
        let (user_part, host_part) = match spec.rfind('@') {
            Some(idx) => (Some(&spec[..idx]), &spec[idx + 1..]),
            None => (None, spec),
        };

        let user = match user_part {
            Some("") => {
                warn!(target: "cockpit-ssh", "blank user in target {spec:?} ignored");
                None
            }
            Some(u) => Some(u.to_owned()),
            None => None,
        };

        let (host, port) = match host_part.rfind(':') {
            Some(idx) => {
                let (host, port_str) = (&host_part[..idx], &host_part[idx + 1..]);
                match port_str.parse::<u32>() {
                    Ok(p) if p > 0 && p <= 65535 => (host.to_owned(), p as u16),
                    _ => {
                        warn!(target: "cockpit-ssh", "invalid port in target {spec:?}, using default");
                        (host_part.to_owned(), DEFAULT_PORT)
                    }
                }
            }
            None => (host_part.to_owned(), DEFAULT_PORT),
        };

        Target { user, host, port }
    }

    pub fn username_or(&self, default: &str) -> String {
        self.user.clone().unwrap_or_else(|| default.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_host_port() {
        let t = Target::parse("root@example.com:2222");
        assert_eq!(t.user.as_deref(), Some("root"));
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 2222);
    }

    #[test]
    fn defaults_port_to_22() {
        let t = Target::parse("example.com");
        assert_eq!(t.port, 22);
        assert_eq!(t.user, None);
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let t = Target::parse("x:0");
        assert_eq!(t.host, "x:0");
        assert_eq!(t.port, 22);
    }

    #[test]
    fn blank_user_is_ignored() {
        let t = Target::parse("@host");
        assert_eq!(t.user, None);
        assert_eq!(t.host, "host");
    }

    #[test]
    fn rightmost_at_and_colon_win() {
        // A user name containing '@' (unusual, but tie-break rule is explicit).
        let t = Target::parse("a@b@host:22");
        assert_eq!(t.user.as_deref(), Some("a@b"));
        assert_eq!(t.host, "host");
        assert_eq!(t.port, 22);
    }

    #[test]
    fn non_numeric_port_tail_is_part_of_host() {
        let t = Target::parse("host:abc");
        assert_eq!(t.host, "host:abc");
        assert_eq!(t.port, 22);
    }
}
