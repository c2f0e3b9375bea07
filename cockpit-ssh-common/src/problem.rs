/// Problem strings crossing the broker/upstream interface boundary (§7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Problem {
    AuthenticationFailed,
    UnknownHostKey,
    InvalidHostKey,
    UnknownHost,
    NoHost,
    NoCockpit,
    Terminated,
    Disconnected,
    InternalError,
    Timeout,
    NotSupported,
    AccessDenied,
    NotFound,
}

impl Problem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Problem::AuthenticationFailed => "authentication-failed",
            Problem::UnknownHostKey => "unknown-hostkey",
            Problem::InvalidHostKey => "invalid-hostkey",
            Problem::UnknownHost => "unknown-host",
            Problem::NoHost => "no-host",
            Problem::NoCockpit => "no-cockpit",
            Problem::Terminated => "terminated",
            Problem::Disconnected => "disconnected",
            Problem::InternalError => "internal-error",
            Problem::Timeout => "timeout",
            Problem::NotSupported => "not-supported",
            Problem::AccessDenied => "access-denied",
            Problem::NotFound => "not-found",
        }
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps POSIX-ish connect/pipe failures onto the problem taxonomy, as the
/// relay does when a connect() or exec() fails at the OS level.
pub fn problem_from_io_error(err: &std::io::Error) -> Problem {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::PermissionDenied => Problem::AccessDenied,
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => Problem::NotFound,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Problem::Disconnected
        }
        _ => Problem::NoHost,
    }
}
