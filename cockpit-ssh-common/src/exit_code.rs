use crate::Problem;

/// The relay process's exit code, as observed by the broker via wait status.
///
/// See §3 `ExitCode` and §6.4. The broker treats this mapping as
/// authoritative, overriding any problem string reported on the auth FD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    InternalError,
    AuthenticationFailed,
    NoCockpit,
    Disconnected,
    Terminated,
    /// Any other raw exit status, mapped to `internal-error` like the
    /// original `exit_code_problem()`'s `default:` arm.
    Other(i32),
}

impl ExitCode {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => ExitCode::Success,
            1 => ExitCode::InternalError,
            2 => ExitCode::AuthenticationFailed,
            127 => ExitCode::NoCockpit,
            254 => ExitCode::Disconnected,
            255 => ExitCode::Terminated,
            other => ExitCode::Other(other),
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::InternalError => 1,
            ExitCode::AuthenticationFailed => 2,
            ExitCode::NoCockpit => 127,
            ExitCode::Disconnected => 254,
            ExitCode::Terminated => 255,
            ExitCode::Other(code) => *code,
        }
    }

    /// `None` for success; otherwise the problem string attached to the
    /// synthesized `close` message.
    pub fn problem(&self) -> Option<Problem> {
        match self {
            ExitCode::Success => None,
            ExitCode::AuthenticationFailed => Some(Problem::AuthenticationFailed),
            ExitCode::NoCockpit => Some(Problem::NoCockpit),
            ExitCode::Disconnected => Some(Problem::Disconnected),
            ExitCode::Terminated => Some(Problem::Terminated),
            ExitCode::InternalError | ExitCode::Other(_) => Some(Problem::InternalError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_codes() {
        assert_eq!(ExitCode::from_raw(0).problem(), None);
        assert_eq!(
            ExitCode::from_raw(2).problem(),
            Some(Problem::AuthenticationFailed)
        );
        assert_eq!(ExitCode::from_raw(127).problem(), Some(Problem::NoCockpit));
        assert_eq!(
            ExitCode::from_raw(254).problem(),
            Some(Problem::Disconnected)
        );
        assert_eq!(ExitCode::from_raw(255).problem(), Some(Problem::Terminated));
    }

    #[test]
    fn unmapped_code_is_internal_error() {
        assert_eq!(ExitCode::from_raw(42).problem(), Some(Problem::InternalError));
        assert_eq!(ExitCode::from_raw(1).problem(), Some(Problem::InternalError));
    }
}
