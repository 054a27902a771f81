//! Running external platform tools with a deadline.
//!
//! Every tool the relay shells out to (`bluetoothctl`, `hcitool`,
//! `notify-send`, `gdbus`, ...) talks to a system service that may be down
//! or wedged. A tool that has not exited by the deadline is killed and
//! reported as failed.

use crate::common::error::{RelayError, Result};
use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Deadline for a single tool invocation.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Run `program` and return its stdout. Non-zero exit, spawn failure and
/// timeout are all `CommandFailed`.
pub fn run_tool<S: AsRef<OsStr>>(program: &str, args: &[S], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| RelayError::command_failed(program, err.to_string()))?;

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RelayError::command_failed(
                        program,
                        format!("no answer within {}ms, killed", timeout.as_millis()),
                    ));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(RelayError::command_failed(program, err.to_string())),
        }
    };

    let stdout = read_pipe(child.stdout.take());
    if !status.success() {
        let stderr = read_pipe(child.stderr.take());
        return Err(RelayError::command_failed(
            program,
            format!("{}: {}", status, stderr.trim()),
        ));
    }
    Ok(stdout)
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut output = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut output);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_stdout() {
        let out = run_tool("sh", &["-c", "echo hello"], TOOL_TIMEOUT).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_non_zero_exit_carries_stderr() {
        let err = run_tool("sh", &["-c", "echo broken >&2; exit 3"], TOOL_TIMEOUT).unwrap_err();
        match err {
            RelayError::CommandFailed { program, details } => {
                assert_eq!(program, "sh");
                assert!(details.contains("broken"), "details: {}", details);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_hung_tool_is_killed_at_deadline() {
        let start = Instant::now();
        let err = run_tool("sleep", &["30"], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, RelayError::CommandFailed { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program_is_an_error() {
        assert!(run_tool("companion-relay-no-such-tool", &["x"], TOOL_TIMEOUT).is_err());
    }
}
