//! Detached terminal sessions hosting the managed server processes.
//!
//! [`SessionHost`] is the capability a multiplexer backend provides; the
//! [`SessionGateway`] maps identities to session names and enforces the
//! existence guards. Whether a session exists is the only notion of
//! "running" the rest of the crate relies on.

use crate::fsutil::shell_single_quote;
use crate::identity::ServerIdentity;
use crate::process::{args, render_command, CommandOutput, CommandRunner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {session} already exists")]
    SessionAlreadyExists { session: String },
    #[error("session {session} not found")]
    SessionNotFound { session: String },
    #[error("{program} is not installed or not on PATH")]
    HostUnavailable { program: String },
    #[error("session command failed: {command}: {message}")]
    Command { command: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Screen,
    Tmux,
}

impl SessionBackend {
    pub fn program(self) -> &'static str {
        match self {
            Self::Screen => "screen",
            Self::Tmux => "tmux",
        }
    }
}

pub trait SessionHost {
    fn has_session(&self, name: &str) -> Result<bool, SessionError>;
    /// Starts a detached session whose initial process is `command`; the
    /// session ends when that process exits.
    fn create(&self, name: &str, command: &[String]) -> Result<(), SessionError>;
    /// `line` is already terminated by exactly one newline.
    fn send_input(&self, name: &str, line: &str) -> Result<(), SessionError>;
    fn kill(&self, name: &str) -> Result<(), SessionError>;
    fn list(&self) -> Result<Vec<String>, SessionError>;
    fn attach_command(&self, name: &str) -> Vec<String>;
}

impl<T: SessionHost + ?Sized> SessionHost for &T {
    fn has_session(&self, name: &str) -> Result<bool, SessionError> {
        (**self).has_session(name)
    }

    fn create(&self, name: &str, command: &[String]) -> Result<(), SessionError> {
        (**self).create(name, command)
    }

    fn send_input(&self, name: &str, line: &str) -> Result<(), SessionError> {
        (**self).send_input(name, line)
    }

    fn kill(&self, name: &str) -> Result<(), SessionError> {
        (**self).kill(name)
    }

    fn list(&self) -> Result<Vec<String>, SessionError> {
        (**self).list()
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        (**self).attach_command(name)
    }
}

impl<T: SessionHost + ?Sized> SessionHost for Box<T> {
    fn has_session(&self, name: &str) -> Result<bool, SessionError> {
        (**self).has_session(name)
    }

    fn create(&self, name: &str, command: &[String]) -> Result<(), SessionError> {
        (**self).create(name, command)
    }

    fn send_input(&self, name: &str, line: &str) -> Result<(), SessionError> {
        (**self).send_input(name, line)
    }

    fn kill(&self, name: &str) -> Result<(), SessionError> {
        (**self).kill(name)
    }

    fn list(&self) -> Result<Vec<String>, SessionError> {
        (**self).list()
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        (**self).attach_command(name)
    }
}

fn invoke<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
) -> Result<CommandOutput, SessionError> {
    runner.run(program, args, None).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            SessionError::HostUnavailable {
                program: program.to_string(),
            }
        } else {
            SessionError::Command {
                command: render_command(program, args),
                message: err.to_string(),
            }
        }
    })
}

fn invoke_checked<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
) -> Result<CommandOutput, SessionError> {
    let output = invoke(runner, program, args)?;
    if !output.success() {
        return Err(SessionError::Command {
            command: render_command(program, args),
            message: format!("exit status {}: {}", output.status_code, output.stderr_text()),
        });
    }
    Ok(output)
}

/// GNU screen backend.
#[derive(Debug, Clone)]
pub struct ScreenHost<R> {
    runner: R,
}

impl<R: CommandRunner> ScreenHost<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// `<pid>.<name>` of the session, so `-S` never prefix-matches a
    /// longer sibling name.
    fn resolve(&self, name: &str) -> Result<String, SessionError> {
        let output = invoke(&self.runner, "screen", &args(["-ls"]))?;
        parse_screen_sessions(&output.stdout_text())
            .into_iter()
            .find(|(_, session)| session == name)
            .map(|(full, _)| full)
            .ok_or_else(|| SessionError::SessionNotFound {
                session: name.to_string(),
            })
    }
}

/// Pairs of (`pid.name`, `name`) from `screen -ls` output. The exit status
/// of `screen -ls` is not meaningful across versions, so only the listing
/// is parsed.
fn parse_screen_sessions(text: &str) -> Vec<(String, String)> {
    let mut sessions = Vec::new();
    for line in text.lines() {
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let Some((pid, name)) = token.split_once('.') else {
            continue;
        };
        if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) || name.is_empty() {
            continue;
        }
        sessions.push((token.to_string(), name.to_string()));
    }
    sessions
}

/// `screen -X stuff` expands `^X` caret codes, backslash escapes and `$VAR`
/// in its argument. Each of those characters is backslash-escaped so the
/// text is typed literally.
fn escape_stuff(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        if matches!(c, '\\' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl<R: CommandRunner> SessionHost for ScreenHost<R> {
    fn has_session(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.list()?.iter().any(|session| session == name))
    }

    fn create(&self, name: &str, command: &[String]) -> Result<(), SessionError> {
        let mut cmd_args = args(["-dmS", name]);
        cmd_args.extend(command.iter().cloned());
        invoke_checked(&self.runner, "screen", &cmd_args)?;
        Ok(())
    }

    fn send_input(&self, name: &str, line: &str) -> Result<(), SessionError> {
        let target = self.resolve(name)?;
        let escaped = escape_stuff(line);
        invoke_checked(
            &self.runner,
            "screen",
            &args(["-S", &target, "-p", "0", "-X", "stuff", &escaped]),
        )?;
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<(), SessionError> {
        let target = self.resolve(name)?;
        invoke_checked(&self.runner, "screen", &args(["-S", &target, "-X", "quit"]))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SessionError> {
        let output = invoke(&self.runner, "screen", &args(["-ls"]))?;
        Ok(parse_screen_sessions(&output.stdout_text())
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        args(["screen", "-r", name])
    }
}

/// tmux backend. Targets use the `=` prefix for exact session matching.
#[derive(Debug, Clone)]
pub struct TmuxHost<R> {
    runner: R,
}

impl<R: CommandRunner> TmuxHost<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> SessionHost for TmuxHost<R> {
    fn has_session(&self, name: &str) -> Result<bool, SessionError> {
        let output = invoke(
            &self.runner,
            "tmux",
            &args(["has-session", "-t", &format!("={name}")]),
        )?;
        Ok(output.success())
    }

    fn create(&self, name: &str, command: &[String]) -> Result<(), SessionError> {
        let mut cmd_args = args(["new-session", "-d", "-s", name]);
        // a single argument is handed to the shell by tmux
        match command {
            [single] => cmd_args.push(shell_single_quote(single)),
            _ => cmd_args.extend(command.iter().cloned()),
        }
        invoke_checked(&self.runner, "tmux", &cmd_args)?;
        Ok(())
    }

    fn send_input(&self, name: &str, line: &str) -> Result<(), SessionError> {
        let target = format!("={name}:");
        let text = line.trim_end_matches('\n');
        invoke_checked(
            &self.runner,
            "tmux",
            &args(["send-keys", "-t", &target, "-l", text]),
        )?;
        invoke_checked(
            &self.runner,
            "tmux",
            &args(["send-keys", "-t", &target, "Enter"]),
        )?;
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<(), SessionError> {
        invoke_checked(
            &self.runner,
            "tmux",
            &args(["kill-session", "-t", &format!("={name}")]),
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SessionError> {
        let output = invoke(
            &self.runner,
            "tmux",
            &args(["list-sessions", "-F", "#{session_name}"]),
        )?;
        // no tmux server running means no sessions
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        args(["tmux", "attach", "-t", &format!("={name}")])
    }
}

/// Identity-keyed view over a [`SessionHost`].
#[derive(Debug, Clone)]
pub struct SessionGateway<H> {
    host: H,
    prefix: String,
}

impl<H: SessionHost> SessionGateway<H> {
    pub fn new(host: H, prefix: impl Into<String>) -> Self {
        Self {
            host,
            prefix: prefix.into(),
        }
    }

    pub fn session_name(&self, identity: &ServerIdentity) -> String {
        format!("{}{}", self.prefix, identity)
    }

    pub fn has_session(&self, identity: &ServerIdentity) -> Result<bool, SessionError> {
        self.host.has_session(&self.session_name(identity))
    }

    pub fn create(
        &self,
        identity: &ServerIdentity,
        command: &[String],
    ) -> Result<(), SessionError> {
        let session = self.session_name(identity);
        if self.host.has_session(&session)? {
            return Err(SessionError::SessionAlreadyExists { session });
        }
        self.host.create(&session, command)?;
        info!(server = %identity, %session, "created session");
        Ok(())
    }

    /// Sends `text` as one input line. Trailing line breaks are collapsed so
    /// exactly one newline is transmitted.
    pub fn send_line(&self, identity: &ServerIdentity, text: &str) -> Result<(), SessionError> {
        let session = self.session_name(identity);
        if !self.host.has_session(&session)? {
            return Err(SessionError::SessionNotFound { session });
        }
        let mut line = text.trim_end_matches(['\n', '\r']).to_string();
        line.push('\n');
        debug!(server = %identity, %session, "sending input line");
        self.host.send_input(&session, &line)
    }

    pub fn kill(&self, identity: &ServerIdentity) -> Result<(), SessionError> {
        let session = self.session_name(identity);
        if !self.host.has_session(&session)? {
            return Err(SessionError::SessionNotFound { session });
        }
        self.host.kill(&session)?;
        info!(server = %identity, %session, "killed session");
        Ok(())
    }

    /// Identities among `known` that currently have a session.
    pub fn list_active(
        &self,
        known: &[ServerIdentity],
    ) -> Result<BTreeSet<ServerIdentity>, SessionError> {
        if known.is_empty() {
            return Ok(BTreeSet::new());
        }
        let live: BTreeSet<String> = self.host.list()?.into_iter().collect();
        Ok(known
            .iter()
            .filter(|identity| live.contains(&self.session_name(identity)))
            .cloned()
            .collect())
    }

    pub fn attach_command(&self, identity: &ServerIdentity) -> Vec<String> {
        self.host.attach_command(&self.session_name(identity))
    }
}
