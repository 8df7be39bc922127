//! Utilities for the `benchmarkoor` binary.

use color_eyre::{eyre::ensure, Result};
use std::process::Output;
use tokio::process::Command;

/// Runs a command in a child process, capturing its output.
///
/// ## Takes
/// - `cmd` - The command to run.
/// - `what` - A short description used in the error message.
///
/// ## Returns
/// - `Result<Output>` - The captured output if the command exited successfully.
pub(crate) async fn run_cmd(cmd: &mut Command, what: &str) -> Result<Output> {
    let output = cmd.output().await?;
    ensure!(
        output.status.success(),
        "{what} failed ({}): {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    );
    Ok(output)
}

/// Runs a command, returning its trimmed stdout as a string.
pub(crate) async fn run_cmd_stdout(cmd: &mut Command, what: &str) -> Result<String> {
    let output = run_cmd(cmd, what).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Parses a Docker-style size string (e.g. `512m`, `2g`, `1024`) into bytes.
pub(crate) fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    ensure!(!s.is_empty(), "empty size string");

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    ensure!(!digits.is_empty(), "invalid size string: {s}");

    let value: u64 = digits.parse()?;
    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1u64 << 40,
        other => color_eyre::eyre::bail!("invalid size suffix: {other}"),
    };
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_docker_style_strings() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("512m").unwrap(), 512 << 20);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
        assert_eq!(parse_size("2GB").unwrap(), 2 << 30);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("g").is_err());
        assert!(parse_size("12x").is_err());
    }

    #[tokio::test]
    async fn run_cmd_surfaces_failure_status() {
        let err = run_cmd(tokio::process::Command::new("false").arg("x"), "false")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("false failed"));
    }
}
