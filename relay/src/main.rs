//! Remote command relay over a versioned file in a GitHub repository.
//!
//! `relay send` appends a directive and waits for the answer; `relay agent`
//! runs directives as they appear. Both sides only ever write with a
//! compare-and-swap against the version they last read.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};

use relay::agent::{AgentConfig, AgentEvent, AgentExit, CommitOutcome, start_agent};
use relay::controller::{ControllerSession, SendOutcome};
use relay::core::types::PollConfig;
use relay::exit_codes;
use relay::io::config::{DEFAULT_CONFIG_PATH, RelayConfig, apply_env, load_config, write_config};
use relay::io::executor::ShellExecutor;
use relay::io::github::GitHubContents;
use relay::io::http::DEFAULT_REQUEST_TIMEOUT;
use relay::io::lock::FileLockProvider;
use relay::io::mirror::RawMirror;
use relay::io::reader::{Authoritative, DualPathReader, FetchStrategy, ReadCache};
use relay::io::resource::ResourceError;
use relay::logging;
use relay::script::{ScriptParams, render_agent_script};
use relay::signals::stop_on_signal;

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Relay shell directives through a file in a GitHub repository"
)]
struct Cli {
    /// Config file (TOML). Missing files mean defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Flags that win over the config file and `RELAY_*` variables.
#[derive(Args, Debug, Default)]
struct Overrides {
    #[arg(long, global = true)]
    owner: Option<String>,
    #[arg(long, global = true)]
    repo: Option<String>,
    /// File inside the repository.
    #[arg(long, global = true)]
    path: Option<String>,
    #[arg(long, global = true)]
    branch: Option<String>,
    /// Poll interval in milliseconds (minimum 100).
    #[arg(long = "interval-ms", global = true)]
    interval_ms: Option<u64>,
}

impl Overrides {
    fn apply(self, cfg: &mut RelayConfig) {
        if let Some(owner) = self.owner {
            cfg.owner = owner;
        }
        if let Some(repo) = self.repo {
            cfg.repo = repo;
        }
        if let Some(path) = self.path {
            cfg.path = path;
        }
        if let Some(branch) = self.branch {
            cfg.branch = branch;
        }
        if let Some(interval_ms) = self.interval_ms {
            cfg.interval_ms = interval_ms;
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config file (the token is never written).
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Append a directive and wait for the agent's answer.
    Send {
        /// Directive words, joined with spaces into one line.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        directive: Vec<String>,
    },
    /// Print the full current content of the resource.
    Show,
    /// Run directives as they appear, until interrupted.
    Agent {
        /// Directory for the agent lock marker.
        #[arg(long)]
        lock_dir: Option<PathBuf>,
        /// Working directory for directives.
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Print a standalone bash agent with the current settings baked in.
    Script {
        /// Write to this file (mode 0700 on unix) instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the remaining API quota.
    Rate,
    /// Print the effective configuration with the token masked.
    Config,
}

impl Command {
    fn default_log_directive(&self) -> &'static str {
        match self {
            Command::Agent { .. } => "relay=info",
            _ => "warn",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.command.default_log_directive());
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ResourceError>() {
        Some(ResourceError::VersionConflict { .. }) => exit_codes::CONFLICT,
        _ => exit_codes::INVALID,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut cfg = load_config(&cli.config)?;
    apply_env(&mut cfg, |key| std::env::var(key).ok())?;
    cli.overrides.apply(&mut cfg);
    cfg.validate()?;

    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, &cfg, force),
        Command::Send { directive } => cmd_send(&cfg, &directive.join(" ")),
        Command::Show => cmd_show(&cfg),
        Command::Agent { lock_dir, workdir } => cmd_agent(&cfg, lock_dir, workdir),
        Command::Script { output } => cmd_script(&cfg, output.as_deref()),
        Command::Rate => cmd_rate(&cfg),
        Command::Config => {
            println!("{}", cfg.describe());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(path: &Path, cfg: &RelayConfig, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut file_cfg = cfg.clone();
    file_cfg.token = None;
    write_config(path, &file_cfg)?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn github(cfg: &RelayConfig) -> Result<GitHubContents> {
    cfg.require_remote()?;
    let token = cfg.token().context("token is not set")?;
    Ok(GitHubContents::new(
        &cfg.endpoints.api_base,
        token,
        DEFAULT_REQUEST_TIMEOUT,
    ))
}

/// Raw mirror first, authenticated metadata read as the fallback.
fn dual_path_reader(cfg: &RelayConfig, resource: &GitHubContents) -> DualPathReader {
    let strategies: Vec<Box<dyn FetchStrategy + Send>> = vec![
        Box::new(RawMirror::new(
            &cfg.endpoints.raw_base,
            DEFAULT_REQUEST_TIMEOUT,
        )),
        Box::new(Authoritative::new(resource.clone())),
    ];
    DualPathReader::new(strategies, ReadCache::new())
}

fn cmd_send(cfg: &RelayConfig, directive: &str) -> Result<i32> {
    let resource = github(cfg)?;
    let reader = dual_path_reader(cfg, &resource);
    let poll = PollConfig::for_controller(cfg.interval_ms)?;
    let mut session = ControllerSession::new(resource, reader, cfg.location(), poll);

    match session.send(directive)? {
        SendOutcome::Changed { body, .. } => {
            println!("{body}");
            Ok(exit_codes::OK)
        }
        SendOutcome::NoChange { posted, elapsed } => {
            eprintln!(
                "no change after {:.1}s; directive is posted as {posted}",
                elapsed.as_secs_f64()
            );
            Ok(exit_codes::NO_CHANGE)
        }
    }
}

fn cmd_show(cfg: &RelayConfig) -> Result<i32> {
    let resource = github(cfg)?;
    let reader = dual_path_reader(cfg, &resource);
    let poll = PollConfig::for_controller(cfg.interval_ms)?;
    let session = ControllerSession::new(resource, reader, cfg.location(), poll);
    println!("{}", session.show()?);
    Ok(exit_codes::OK)
}

fn cmd_agent(cfg: &RelayConfig, lock_dir: Option<PathBuf>, workdir: Option<PathBuf>) -> Result<i32> {
    let resource = github(cfg)?;
    let mut reader = dual_path_reader(cfg, &resource);
    let agent_cfg = AgentConfig::from_relay_config(cfg, workdir)?;
    let locks = FileLockProvider::new(lock_dir.unwrap_or_else(|| cfg.lock_dir()));

    let stop = Arc::new(AtomicBool::new(false));
    stop_on_signal(Arc::clone(&stop))?;

    let exit = start_agent(
        &locks,
        &resource,
        &mut reader,
        &ShellExecutor,
        &agent_cfg,
        &stop,
        |event| match event {
            AgentEvent::Round(round) => match &round.commit {
                CommitOutcome::Committed { version } | CommitOutcome::Retried { version } => {
                    info!(round = round.round, directive = %round.directive, %version, "result committed");
                }
                CommitOutcome::Abandoned { version } => {
                    warn!(round = round.round, directive = %round.directive, %version, "result dropped after two conflicts");
                }
                CommitOutcome::Superseded { .. } => {
                    warn!(round = round.round, directive = %round.directive, "result dropped, a newer directive replaced it");
                }
                CommitOutcome::Failed { version, error } => {
                    warn!(round = round.round, directive = %round.directive, %version, %error, "result not committed");
                }
            },
            AgentEvent::Skipped { version } => {
                info!(%version, "new version without a directive");
            }
            AgentEvent::Polling { .. } => {}
        },
    )?;
    match exit {
        AgentExit::AlreadyRunning => debug!("agent already running, nothing to do"),
        AgentExit::Stopped { rounds } => info!(rounds, "agent stopped"),
    }
    Ok(exit_codes::OK)
}

fn cmd_script(cfg: &RelayConfig, output: Option<&Path>) -> Result<i32> {
    cfg.require_remote()?;
    let token = cfg.token().context("token is not set")?;
    let script = render_agent_script(&ScriptParams {
        location: cfg.location(),
        token: token.to_string(),
        interval_ms: cfg.interval_ms,
        api_base: cfg.endpoints.api_base.clone(),
    });
    match output {
        Some(path) => {
            fs::write(path, &script).with_context(|| format!("write {}", path.display()))?;
            make_executable(path)?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{script}"),
    }
    Ok(exit_codes::OK)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn cmd_rate(cfg: &RelayConfig) -> Result<i32> {
    let resource = github(cfg)?;
    let rate = resource.rate_limit().context("query rate limit")?;
    println!("{}", rate.render());
    Ok(exit_codes::OK)
}
