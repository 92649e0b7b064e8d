mod archive;
mod backup;
mod config;
mod error;
mod fsutil;
mod identity;
mod installation;
mod lifecycle;
mod logging;
mod process;
mod properties;
mod registry;
mod session;
mod status;
#[cfg(test)]
mod testing;
mod update;

use crate::archive::ZipTool;
use crate::backup::SystemClock;
use crate::config::{init_config, load_config, read_config, resolve_config_path, Config};
use crate::error::BswError;
use crate::fsutil::dir_writable;
use crate::identity::ServerIdentity;
use crate::lifecycle::{Coordinator, StopOutcome};
use crate::logging::{init_logger, resolve_level, LOG_ENV};
use crate::process::SystemRunner;
use crate::registry::ServerRegistry;
use crate::session::{ScreenHost, SessionBackend, SessionGateway, SessionHost, TmuxHost};
use crate::status::RakNetProbe;
use crate::update::{HttpDistribution, UpdateOutcome};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "bsw", version, about = "Bedrock dedicated server wrapper")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// List installed servers and whether they are running
    List,
    /// Download and install a new server
    New { name: String },
    Start {
        name: String,
        /// Start without checking for a newer server build
        #[arg(long)]
        skip_update: bool,
    },
    Stop {
        name: String,
        /// Stop even while players are online
        #[arg(long)]
        force: bool,
    },
    /// Terminate a server that no longer responds to stop
    Kill { name: String },
    Status { name: String },
    /// Attach the terminal to a running server console
    Attach {
        name: String,
        /// Replace this process with the attach command instead of printing it
        #[arg(long)]
        exec: bool,
    },
    /// Broadcast a chat message; `&` style codes are converted
    Message {
        name: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Update {
        #[command(subcommand)]
        command: UpdateCommand,
    },
    /// Read or edit server.properties
    Props {
        name: String,
        #[command(subcommand)]
        command: PropsCommand,
    },
    /// Delete a server and all of its backups
    Purge {
        name: String,
        #[arg(long)]
        yes: bool,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    Create {
        name: String,
        /// Ignore the cooldown and online players
        #[arg(long)]
        force: bool,
    },
    List {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum UpdateCommand {
    Check {
        name: String,
    },
    Apply {
        name: String,
        /// Reinstall even when the installed build is current
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PropsCommand {
    List,
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: &'static str,
    ok: bool,
    message: String,
    remediation: String,
}

type AppCoordinator = Coordinator<
    Box<dyn SessionHost>,
    HttpDistribution,
    ZipTool<SystemRunner>,
    RakNetProbe,
    SystemClock,
>;

fn main() -> Result<(), BswError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    let configured_level = load_config(&ctx.config_path)
        .map(|cfg| cfg.logging.level)
        .unwrap_or_default();
    init_logger(resolve_level(
        cli.verbose,
        env::var(LOG_ENV).ok().as_deref(),
        &configured_level,
    ));

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::List => handle_list(&ctx),
        Commands::New { name } => handle_new(&ctx, &name),
        Commands::Start { name, skip_update } => handle_start(&ctx, &name, skip_update),
        Commands::Stop { name, force } => handle_stop(&ctx, &name, force),
        Commands::Kill { name } => handle_kill(&ctx, &name),
        Commands::Status { name } => handle_status(&ctx, &name),
        Commands::Attach { name, exec } => handle_attach(&ctx, &name, exec),
        Commands::Message { name, text } => handle_message(&ctx, &name, &text.join(" ")),
        Commands::Backup { command } => handle_backup(&ctx, command),
        Commands::Update { command } => handle_update(&ctx, command),
        Commands::Props { name, command } => handle_props(&ctx, &name, command),
        Commands::Purge { name, yes } => handle_purge(&ctx, &name, yes),
        Commands::Doctor => handle_doctor(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn build_coordinator(cfg: &Config) -> AppCoordinator {
    let host: Box<dyn SessionHost> = match cfg.session.backend {
        SessionBackend::Screen => Box::new(ScreenHost::new(SystemRunner)),
        SessionBackend::Tmux => Box::new(TmuxHost::new(SystemRunner)),
    };
    let source = HttpDistribution::new(
        cfg.distribution.links_url.clone(),
        cfg.distribution.user_agent.clone(),
        Duration::from_secs(cfg.distribution.links_timeout_sec),
        Duration::from_secs(cfg.distribution.download_timeout_sec),
    );
    Coordinator::new(
        ServerRegistry::new(cfg.servers_root()),
        SessionGateway::new(host, cfg.session.prefix.clone()),
        source,
        ZipTool::new(SystemRunner),
        RakNetProbe::new(Duration::from_millis(cfg.status.timeout_ms)),
        SystemClock,
        cfg.policy(),
    )
}

fn open_server(ctx: &Context, name: &str) -> Result<(AppCoordinator, ServerIdentity), BswError> {
    let identity = ServerIdentity::parse(name)?;
    let cfg = load_config(&ctx.config_path)?;
    Ok((build_coordinator(&cfg), identity))
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), BswError> {
    match command {
        ConfigCommand::Init => {
            let created = init_config(&ctx.config_path)?;
            let text = if created {
                format!("wrote default config to {}", ctx.config_path.display())
            } else {
                format!("config already exists at {}", ctx.config_path.display())
            };
            output(ctx, json!({"path": ctx.config_path, "created": created}), &text)
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(
                ctx,
                json!({"path": ctx.config_path, "valid": true}),
                &format!("{} is valid", ctx.config_path.display()),
            )
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            let text = serde_yaml::to_string(&cfg)?;
            output(
                ctx,
                json!({
                    "path": ctx.config_path,
                    "servers_root": cfg.servers_root(),
                    "config": serde_json::to_value(&cfg)?,
                }),
                text.trim_end(),
            )
        }
    }
}

fn handle_list(ctx: &Context) -> Result<(), BswError> {
    let cfg = load_config(&ctx.config_path)?;
    let coordinator = build_coordinator(&cfg);
    let servers = coordinator.list()?;
    let text = if servers.is_empty() {
        "no servers installed".to_string()
    } else {
        servers
            .iter()
            .map(|(identity, state)| format!("{identity}\t{state}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let payload: Vec<_> = servers
        .iter()
        .map(|(identity, state)| json!({"name": identity, "state": state}))
        .collect();
    output(ctx, json!({"servers": payload}), &text)
}

fn describe_update(outcome: &UpdateOutcome) -> String {
    match outcome {
        UpdateOutcome::AlreadyCurrent { url } => format!("already current ({url})"),
        UpdateOutcome::Applied { url, mode } => {
            let mode = match mode {
                update::OverwriteMode::Full => "full install",
                update::OverwriteMode::Selective => "update",
            };
            format!("{mode} from {url}")
        }
    }
}

fn handle_new(ctx: &Context, name: &str) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let outcome = coordinator.create(&identity)?;
    output(
        ctx,
        json!({"name": identity, "created": true, "update": outcome}),
        &format!("created {identity}: {}", describe_update(&outcome)),
    )
}

fn handle_start(ctx: &Context, name: &str, skip_update: bool) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let report = coordinator.start(&identity, skip_update)?;
    let mut text = format!("started {identity} in session {}", report.session);
    if let Some(update) = &report.update {
        text.push_str(&format!("\nupdate: {}", describe_update(update)));
    }
    output(ctx, serde_json::to_value(&report)?, &text)
}

fn handle_stop(ctx: &Context, name: &str, force: bool) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let outcome = coordinator.stop(&identity, force)?;
    let text = match outcome {
        StopOutcome::NotRunning => format!("{identity} is not running"),
        StopOutcome::StopRequested => format!("sent stop to {identity}"),
        StopOutcome::Stopped => format!("{identity} stopped"),
        StopOutcome::Killed => format!("{identity} killed"),
    };
    output(ctx, json!({"name": identity, "outcome": outcome}), &text)
}

fn handle_kill(ctx: &Context, name: &str) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let outcome = coordinator.kill(&identity)?;
    let text = match outcome {
        StopOutcome::Killed => format!("{identity} killed"),
        _ => format!("{identity} is not running"),
    };
    output(ctx, json!({"name": identity, "outcome": outcome}), &text)
}

fn handle_status(ctx: &Context, name: &str) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let status = coordinator.status(&identity)?;
    let show = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
    let text = [
        format!("name: {}", status.server),
        format!("state: {}", status.state),
        format!("server-port: {}", show(status.port_v4.map(|p| p.to_string()))),
        format!("server-port-v6: {}", show(status.port_v6.map(|p| p.to_string()))),
        format!("lan visibility: {}", status.lan_visibility),
        format!(
            "players online: {}",
            show(status.players_online.map(|p| p.to_string()))
        ),
        format!(
            "distribution: {}",
            if status.distribution.is_empty() {
                "-"
            } else {
                status.distribution.as_str()
            }
        ),
        format!("backups: {}", status.backups),
        format!(
            "minutes since last backup: {}",
            show(status.minutes_since_last_backup.map(|m| m.to_string()))
        ),
    ]
    .join("\n");
    output(ctx, serde_json::to_value(&status)?, &text)
}

fn handle_attach(ctx: &Context, name: &str, exec: bool) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let command = coordinator.attach_command(&identity)?;
    if !exec {
        return output(ctx, json!({"name": identity, "command": command}), &command.join(" "));
    }
    let Some((program, args)) = command.split_first() else {
        return Err(BswError::Process("empty attach command".to_string()));
    };
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(program).args(args).exec();
        Err(BswError::Process(format!("failed to run {program}: {err}")))
    }
    #[cfg(not(unix))]
    {
        let status = std::process::Command::new(program).args(args).status()?;
        if !status.success() {
            return Err(BswError::Process(format!("{program} exited with {status}")));
        }
        Ok(())
    }
}

fn handle_message(ctx: &Context, name: &str, text: &str) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    let line = coordinator.message(&identity, text)?;
    output(
        ctx,
        json!({"name": identity, "sent": line}),
        &format!("sent to {identity}: {line}"),
    )
}

fn handle_backup(ctx: &Context, command: BackupCommand) -> Result<(), BswError> {
    match command {
        BackupCommand::Create { name, force } => {
            let (coordinator, identity) = open_server(ctx, &name)?;
            let report = coordinator.backup(&identity, force)?;
            let mut text = format!("created backup {} for {identity}", report.archive);
            if report.restarted {
                text.push_str("\nserver restarted");
            }
            for pruned in &report.pruned {
                text.push_str(&format!("\npruned {pruned}"));
            }
            output(ctx, serde_json::to_value(&report)?, &text)
        }
        BackupCommand::List { name } => {
            let (coordinator, identity) = open_server(ctx, &name)?;
            let listing = coordinator.backup_listing(&identity)?;
            let mut lines = listing.archives.clone();
            if lines.is_empty() {
                lines.push(format!("no backups for {identity}"));
            }
            if let Some(minutes) = listing.minutes_since_last {
                lines.push(format!("minutes since last backup: {minutes}"));
            }
            output(ctx, serde_json::to_value(&listing)?, &lines.join("\n"))
        }
    }
}

fn handle_update(ctx: &Context, command: UpdateCommand) -> Result<(), BswError> {
    match command {
        UpdateCommand::Check { name } => {
            let (coordinator, identity) = open_server(ctx, &name)?;
            let check = coordinator.check_update(&identity)?;
            let text = if check.needs_update {
                format!("{identity}: update available ({})", check.url)
            } else {
                format!("{identity}: up to date ({})", check.url)
            };
            output(ctx, serde_json::to_value(&check)?, &text)
        }
        UpdateCommand::Apply { name, force } => {
            let (coordinator, identity) = open_server(ctx, &name)?;
            let outcome = coordinator.update(&identity, force)?;
            output(
                ctx,
                json!({"name": identity, "update": outcome}),
                &format!("{identity}: {}", describe_update(&outcome)),
            )
        }
    }
}

fn handle_props(ctx: &Context, name: &str, command: PropsCommand) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    if !coordinator.registry().exists(&identity)? {
        return Err(lifecycle::LifecycleError::NotFound {
            server: identity.to_string(),
        }
        .into());
    }
    let store = coordinator.properties();
    match command {
        PropsCommand::List => {
            let props = store.read(&identity)?;
            let text = props
                .entries()
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("\n");
            output(ctx, json!({"name": identity, "properties": props.entries()}), &text)
        }
        PropsCommand::Get { key } => {
            let props = store.read(&identity)?;
            let Some(value) = props.get(&key) else {
                return Err(properties::PropertyError::ConfigKeyMissing { key }.into());
            };
            output(ctx, json!({"name": identity, "key": key, "value": value}), value)
        }
        PropsCommand::Set { key, value } => {
            if let Ok(true) = coordinator.sessions().has_session(&identity) {
                tracing::warn!(server = %identity, "server.properties changes apply after a restart");
            }
            store.set(&identity, &key, &value)?;
            output(
                ctx,
                json!({"name": identity, "key": key, "value": value}),
                &format!("{key}={value}"),
            )
        }
    }
}

fn handle_purge(ctx: &Context, name: &str, yes: bool) -> Result<(), BswError> {
    let (coordinator, identity) = open_server(ctx, name)?;
    if !yes {
        if ctx.json {
            return Err(BswError::Config(
                "purge requires --yes when --json is set".to_string(),
            ));
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete {identity} and all of its backups? This cannot be undone"
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            return output(
                ctx,
                json!({"name": identity, "purged": false}),
                "purge cancelled",
            );
        }
    }
    let removed = coordinator.purge(&identity)?;
    let text = if removed {
        format!("purged {identity}")
    } else {
        format!("nothing to purge for {identity}")
    };
    output(ctx, json!({"name": identity, "purged": removed}), &text)
}

fn collect_doctor_checks(cfg: &Config) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    let backend = cfg.session.backend.program();
    let tool_check = |id: &'static str, program: &str| {
        let found = which::which(program);
        DoctorCheck {
            id,
            ok: found.is_ok(),
            message: match &found {
                Ok(path) => format!("{program} found at {}", path.display()),
                Err(_) => format!("{program} not found on PATH"),
            },
            remediation: format!("install {program} with your package manager"),
        }
    };
    checks.push(tool_check("session_host", backend));
    checks.push(tool_check("zip", "zip"));
    checks.push(tool_check("unzip", "unzip"));

    let root = cfg.servers_root();
    let writable = dir_writable(&root);
    checks.push(DoctorCheck {
        id: "servers_root",
        ok: writable,
        message: if writable {
            format!("{} is writable", root.display())
        } else {
            format!("{} is not writable", root.display())
        },
        remediation: "set paths.servers_root or BSW_SERVERS_DIR to a writable directory"
            .to_string(),
    });
    checks
}

fn handle_doctor(ctx: &Context) -> Result<(), BswError> {
    let cfg = load_config(&ctx.config_path)?;
    let checks = collect_doctor_checks(&cfg);
    let failed = checks.iter().find(|check| !check.ok);

    if ctx.json {
        let payload = JsonResult {
            ok: failed.is_none(),
            result: Some(json!({ "checks": checks })),
            error: failed.map(|check| check.message.clone()),
        };
        print_json(&payload)?;
        if failed.is_some() {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!("[{}] {} - {}", state, check.id, check.message);
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    match failed {
        Some(check) => Err(BswError::Process(check.message.clone())),
        None => Ok(()),
    }
}

fn output(ctx: &Context, payload: serde_json::Value, text: &str) -> Result<(), BswError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{text}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BswError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
