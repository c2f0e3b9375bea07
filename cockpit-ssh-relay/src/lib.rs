pub mod auth;
pub mod auth_fd;
pub mod client;
pub mod env;
pub mod frame;
pub mod hostkey;
pub mod known_hosts;
pub mod relay;

/// The system-wide known-hosts path consulted when the relay is given
/// neither `COCKPIT_SSH_KNOWN_HOSTS_FILE` nor `COCKPIT_SSH_KNOWN_HOSTS_DATA`.
pub fn default_known_hosts_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/ssh/ssh_known_hosts")
}
