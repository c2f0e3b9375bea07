//! Environment-variable inputs to the relay process (§6.2).

use std::path::PathBuf;

use cockpit_ssh_common::Config;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMessageType {
    None,
    Basic,
    Password,
    KeyboardInteractive,
    PrivateKey,
    GssapiMic,
    Bridge,
}

impl AuthMessageType {
    fn parse(value: &str) -> Self {
        match value {
            "none" => AuthMessageType::None,
            "basic" => AuthMessageType::Basic,
            "password" => AuthMessageType::Password,
            "keyboard-interactive" => AuthMessageType::KeyboardInteractive,
            "private-key" => AuthMessageType::PrivateKey,
            "gssapi-mic" => AuthMessageType::GssapiMic,
            "bridge" => AuthMessageType::Bridge,
            _ => AuthMessageType::Bridge,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayEnv {
    pub known_hosts_file: Option<PathBuf>,
    pub known_hosts_data: Option<String>,
    pub bridge_command: String,
    pub connect_to_unknown_hosts: bool,
    pub remote_peer: String,
    pub auth_message_type: AuthMessageType,
    pub ssh_askpass: Option<String>,
    pub gssapi_ccache_path: Option<PathBuf>,
    /// File descriptor the auth conversation arrives on (`[Ssh-Login] authFD`,
    /// `COCKPIT_SSH_AUTH_FD`, §6.3); the broker dup2s it here before exec.
    pub auth_fd: i32,
}

const DEFAULT_BRIDGE_COMMAND: &str = "cockpit-bridge";
const DEFAULT_REMOTE_PEER: &str = "localhost";
pub const DEFAULT_AUTH_FD: i32 = 3;

impl RelayEnv {
    pub fn from_process_env() -> Self {
        Self::from_getter_and_config(
            |name| std::env::var(name).ok(),
            &Config::load("cockpit.conf"),
        )
    }

    pub fn from_getter(get: impl Fn(&str) -> Option<String>) -> Self {
        Self::from_getter_and_config(get, &Config::new())
    }

    pub fn from_getter_and_config(get: impl Fn(&str) -> Option<String>, config: &Config) -> Self {
        let connect_to_unknown_hosts = connect_to_unknown_hosts(&get, config);

        RelayEnv {
            known_hosts_file: get("COCKPIT_SSH_KNOWN_HOSTS_FILE").map(PathBuf::from),
            known_hosts_data: get("COCKPIT_SSH_KNOWN_HOSTS_DATA"),
            bridge_command: get("COCKPIT_SSH_BRIDGE_COMMAND")
                .unwrap_or_else(|| DEFAULT_BRIDGE_COMMAND.to_owned()),
            connect_to_unknown_hosts,
            remote_peer: get("COCKPIT_REMOTE_PEER").unwrap_or_else(|| DEFAULT_REMOTE_PEER.to_owned()),
            auth_message_type: get("COCKPIT_AUTH_MESSAGE_TYPE")
                .map(|v| AuthMessageType::parse(&v))
                .unwrap_or(AuthMessageType::Basic),
            ssh_askpass: get("SSH_ASKPASS"),
            gssapi_ccache_path: get("KRB5CCNAME").map(PathBuf::from),
            auth_fd: get("COCKPIT_SSH_AUTH_FD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_AUTH_FD),
        }
    }
}

/// `cockpit.conf`'s `[Ssh-Login] connectToUnknownHosts` (falling back to the
/// legacy `allowUnknown` key) takes priority over the environment variables
/// the broker sets, mirroring `get_connect_to_unknown_hosts()`.
fn connect_to_unknown_hosts(get: &impl Fn(&str) -> Option<String>, config: &Config) -> bool {
    if let Some(value) = config.string("Ssh-Login", "connectToUnknownHosts") {
        return is_truthy(value);
    }
    if let Some(value) = config.string("Ssh-Login", "allowUnknown") {
        return is_truthy(value);
    }
    get("COCKPIT_SSH_CONNECT_TO_UNKNOWN_HOSTS")
        .or_else(|| get("COCKPIT_SSH_ALLOW_UNKNOWN"))
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> RelayEnv {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayEnv::from_getter(move |name| map.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let e = env(&[]);
        assert_eq!(e.bridge_command, "cockpit-bridge");
        assert_eq!(e.remote_peer, "localhost");
        assert!(!e.connect_to_unknown_hosts);
        assert_eq!(e.auth_message_type, AuthMessageType::Basic);
    }

    #[test]
    fn legacy_allow_unknown_alias_is_honoured() {
        let e = env(&[("COCKPIT_SSH_ALLOW_UNKNOWN", "yes")]);
        assert!(e.connect_to_unknown_hosts);
    }

    #[test]
    fn primary_variable_takes_precedence_over_alias() {
        let e = env(&[
            ("COCKPIT_SSH_CONNECT_TO_UNKNOWN_HOSTS", "0"),
            ("COCKPIT_SSH_ALLOW_UNKNOWN", "yes"),
        ]);
        assert!(!e.connect_to_unknown_hosts);
    }

    #[test]
    fn parses_auth_message_type() {
        let e = env(&[("COCKPIT_AUTH_MESSAGE_TYPE", "private-key")]);
        assert_eq!(e.auth_message_type, AuthMessageType::PrivateKey);
    }

    #[test]
    fn defaults_to_auth_fd_three() {
        let e = env(&[]);
        assert_eq!(e.auth_fd, 3);
    }

    #[test]
    fn honours_configured_auth_fd() {
        let e = env(&[("COCKPIT_SSH_AUTH_FD", "7")]);
        assert_eq!(e.auth_fd, 7);
    }

    struct TempConfigFile {
        path: std::path::PathBuf,
    }

    impl TempConfigFile {
        fn new(contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "cockpit-ssh-relay-env-test-{}-{:?}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            std::fs::write(&path, contents).unwrap();
            Self { path }
        }
    }

    impl Drop for TempConfigFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn config_file_connect_to_unknown_hosts_overrides_env() {
        let file = TempConfigFile::new("[Ssh-Login]\nconnectToUnknownHosts = no\n");
        let config = Config::load(file.path.to_str().unwrap());
        let e = RelayEnv::from_getter_and_config(
            |name| {
                if name == "COCKPIT_SSH_CONNECT_TO_UNKNOWN_HOSTS" {
                    Some("1".to_owned())
                } else {
                    None
                }
            },
            &config,
        );
        assert!(!e.connect_to_unknown_hosts);
    }

    #[test]
    fn config_file_allow_unknown_alias_is_honoured() {
        let file = TempConfigFile::new("[Ssh-Login]\nallowUnknown = yes\n");
        let config = Config::load(file.path.to_str().unwrap());
        let e = RelayEnv::from_getter_and_config(|_| None, &config);
        assert!(e.connect_to_unknown_hosts);
    }

    #[test]
    fn falls_back_to_env_when_config_is_silent() {
        let e = env(&[("COCKPIT_SSH_ALLOW_UNKNOWN", "yes")]);
        assert!(e.connect_to_unknown_hosts);
    }
}
