// Output rendering for the CLI.
//
// TTY gets human-readable text, pipes get one JSON document per line, `--json` forces JSON.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

use crate::client::ApiError;
use crate::exit_code::ExitCode;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// One JSON document per line.
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let mut out = io::stdout().lock();
    write_output(&mut out, format, value, human_fn)?;
    out.flush()
}

pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "error", ANSI_RED, code, message);
}

fn print_diagnostic(format: OutputFormat, label: &str, color: &str, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line(label, message, io::stderr().is_terminal(), color);
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({ label: { "code": code, "message": message } });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, &code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (String, String) {
    if let Some(api_error) = error.chain().find_map(|cause| cause.downcast_ref::<ApiError>()) {
        let message = match api_error.code.as_str() {
            "LOCK_HELD" => format!(
                "{}. Ask the holder to hand it over with: tandem lock request",
                api_error.message
            ),
            "AUTH_INVALID_TOKEN" => format!(
                "Authentication failed ({}). Check --token, TANDEM_TOKEN or ~/.tandem/config.toml",
                api_error.message
            ),
            "AUTH_FORBIDDEN" => format!("Permission denied: {}", api_error.message),
            _ => api_error.message.clone(),
        };
        return (api_error.code.clone(), message);
    }

    let message = format!("{error:#}");
    match ExitCode::from_error(error) {
        ExitCode::Network => (
            "NETWORK_ERROR".to_string(),
            format!("Could not reach the tandem server ({message}). Check --server or TANDEM_SERVER_URL"),
        ),
        ExitCode::Auth => ("AUTH_FAILURE".to_string(), message),
        _ => ("CLI_ERROR".to_string(), message),
    }
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Info {
        name: String,
        count: u32,
    }

    #[test]
    fn detect_tty_returns_human() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn write_output_human_format() {
        let info = Info { name: "alice".into(), count: 1 };
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Human, &info, |i| format!("Name: {}", i.name))
            .expect("write should succeed");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "Name: alice\n");
    }

    #[test]
    fn write_output_json_is_one_line() {
        let info = Info { name: "bob".into(), count: 42 };
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Json, &info, |_| {
            unreachable!("human_fn should not be called in JSON mode")
        })
        .expect("write should succeed");
        let output = String::from_utf8(buf).expect("utf8");
        assert_eq!(output.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(output.trim()).expect("json");
        assert_eq!(parsed["name"], "bob");
        assert_eq!(parsed["count"], 42);
    }

    #[test]
    fn render_human_error_uses_color_for_tty() {
        let line = render_human_stderr_line("error", "boom", true, ANSI_RED);
        assert!(line.contains(ANSI_RED));
        assert!(line.contains(ANSI_RESET));
        assert!(line.contains("boom"));
    }

    #[test]
    fn render_human_error_without_tty_is_plain() {
        let line = render_human_stderr_line("error", "careful", false, ANSI_RED);
        assert_eq!(line, "error: careful");
    }

    #[test]
    fn actionable_error_lock_held_suggests_request() {
        let err = anyhow::Error::new(ApiError {
            status: 409,
            code: "LOCK_HELD".into(),
            message: "object is locked by another user".into(),
        })
        .context("lock acquire failed");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "LOCK_HELD");
        assert!(message.contains("tandem lock request"));
    }

    #[test]
    fn actionable_error_auth_failure_message() {
        let err = anyhow::Error::new(ApiError {
            status: 401,
            code: "AUTH_INVALID_TOKEN".into(),
            message: "token expired".into(),
        });
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "AUTH_INVALID_TOKEN");
        assert!(message.contains("TANDEM_TOKEN"));
        assert!(message.contains("token expired"));
    }

    #[test]
    fn actionable_error_network_message() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "NETWORK_ERROR");
        assert!(message.contains("TANDEM_SERVER_URL"));
    }

    #[test]
    fn actionable_error_passes_through_other_messages() {
        let err = anyhow::anyhow!("stream id must not be empty");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "CLI_ERROR");
        assert_eq!(message, "stream id must not be empty");
    }
}
