// Consistent exit codes for the tandem CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   11 = authentication or permission error
//   12 = conflict (object locked by someone else, stale write)
//   13 = network error

use std::process;

use crate::client::ApiError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Conflict = 12,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(api_err) = cause.downcast_ref::<ApiError>() {
                return Self::from_api_code(api_err.code.as_str());
            }
            if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
                if http_err.is_connect() || http_err.is_timeout() || http_err.is_request() {
                    return Self::Network;
                }
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("auth token") {
            return Self::Auth;
        }

        Self::Error
    }

    /// Map a server error code to an exit code.
    pub fn from_api_code(code: &str) -> Self {
        match code {
            "AUTH_INVALID_TOKEN" | "AUTH_FORBIDDEN" => Self::Auth,

            "LOCK_HELD" | "CONFLICT" => Self::Conflict,

            "VALIDATION_FAILED" => Self::Usage,

            "STORAGE_UNAVAILABLE" => Self::Network,

            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: &str) -> anyhow::Error {
        anyhow::Error::new(ApiError { status: 400, code: code.into(), message: "nope".into() })
    }

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::Auth.code(), 11);
        assert_eq!(ExitCode::Conflict.code(), 12);
        assert_eq!(ExitCode::Network.code(), 13);
    }

    #[test]
    fn from_api_code_auth_errors() {
        assert_eq!(ExitCode::from_api_code("AUTH_INVALID_TOKEN"), ExitCode::Auth);
        assert_eq!(ExitCode::from_api_code("AUTH_FORBIDDEN"), ExitCode::Auth);
    }

    #[test]
    fn from_api_code_conflict_errors() {
        assert_eq!(ExitCode::from_api_code("LOCK_HELD"), ExitCode::Conflict);
        assert_eq!(ExitCode::from_api_code("CONFLICT"), ExitCode::Conflict);
    }

    #[test]
    fn from_api_code_other_errors() {
        assert_eq!(ExitCode::from_api_code("VALIDATION_FAILED"), ExitCode::Usage);
        assert_eq!(ExitCode::from_api_code("STORAGE_UNAVAILABLE"), ExitCode::Network);
        assert_eq!(ExitCode::from_api_code("NOT_FOUND"), ExitCode::Error);
        assert_eq!(ExitCode::from_api_code("INTERNAL_ERROR"), ExitCode::Error);
    }

    #[test]
    fn from_error_api_error_in_chain() {
        let err = api_error("LOCK_HELD").context("lock acquire failed");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Conflict);
    }

    #[test]
    fn from_error_connection_refused_is_network() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn from_error_missing_token_is_auth() {
        let err = anyhow::anyhow!("no auth token configured; pass --token or set TANDEM_TOKEN");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Auth);
    }

    #[test]
    fn from_error_generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }
}
