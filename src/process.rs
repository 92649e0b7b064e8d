use std::io;
use std::path::Path;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs an external program to completion and captures its output. The
/// multiplexer hosts and the zip tooling go through this seam so tests can
/// record invocations instead of spawning processes.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String], cwd: Option<&Path>)
        -> Result<CommandOutput, io::Error>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, io::Error> {
        (**self).run(program, args, cwd)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, io::Error> {
        debug!(command = %render_command(program, args), "running");
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_whitespace_and_empty_arguments() {
        let rendered = render_command("screen", &args(["-S", "bsw-alpha1", "-X", "stuff", "say hi\n", ""]));
        assert_eq!(rendered, "screen -S bsw-alpha1 -X stuff \"say hi\n\" \"\"");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_status_and_output() {
        let out = SystemRunner
            .run("sh", &args(["-c", "printf out; printf err >&2; exit 3"]), None)
            .unwrap();
        assert_eq!(out.status_code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout_text(), "out");
        assert_eq!(out.stderr_text(), "err");
    }

    #[test]
    fn system_runner_reports_missing_program() {
        let err = SystemRunner
            .run("bsw-definitely-not-a-real-program", &[], None)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
