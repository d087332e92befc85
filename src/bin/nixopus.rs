// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use nixopus::{
    env::EnvFile,
    log::TracingLogger,
    path::default_config_path,
    proxy::{Payload, ProxyTarget, Publisher, PublisherConfig},
    writer::ConfigWriter,
    Settings,
};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::exit,
    sync::Arc,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "nixopus [options] <nixopus-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to settings file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = Settings::load(&config_path)?;

        match self.command {
            Command::Conf(ConfCommand::List(opts)) => run_conf_list(&settings, opts),
            Command::Conf(ConfCommand::Set(opts)) => run_conf_set(&settings, opts),
            Command::Conf(ConfCommand::Delete(opts)) => run_conf_delete(&settings, opts),
            Command::Proxy(ProxyCommand::Load(opts)) => run_proxy_load(&settings, opts).await,
            Command::Proxy(ProxyCommand::Status(opts)) => run_proxy_status(&settings, opts).await,
            Command::Proxy(ProxyCommand::Stop(opts)) => run_proxy_stop(&settings, opts).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Manage service environment files.
    #[command(subcommand)]
    Conf(ConfCommand),

    /// Manage reverse proxy configuration.
    #[command(subcommand)]
    Proxy(ProxyCommand),
}

#[derive(Debug, Clone, Subcommand)]
enum ConfCommand {
    /// List entries of environment file.
    #[command(override_usage = "nixopus conf list [options]")]
    List(EnvFileOptions),

    /// Set entries in environment file.
    #[command(override_usage = "nixopus conf set [options] <KEY=VALUE>...")]
    Set(SetOptions),

    /// Delete entries from environment file.
    #[command(override_usage = "nixopus conf delete [options] <KEY>...")]
    Delete(DeleteOptions),
}

#[derive(Debug, Clone, Subcommand)]
enum ProxyCommand {
    /// Load configuration file into reverse proxy.
    #[command(override_usage = "nixopus proxy load [options]")]
    Load(LoadOptions),

    /// Check whether reverse proxy admin API is up.
    #[command(override_usage = "nixopus proxy status [options]")]
    Status(TargetOptions),

    /// Stop reverse proxy.
    #[command(override_usage = "nixopus proxy stop [options]")]
    Stop(TargetOptions),
}

#[derive(Args, Clone, Debug)]
struct EnvFileOptions {
    /// Service whose environment file to use.
    #[arg(short, long, value_name = "service", default_value = "api")]
    pub service: String,

    /// Path to environment file, overriding the service lookup.
    #[arg(short, long, value_name = "path")]
    pub env_file: Option<PathBuf>,
}

impl EnvFileOptions {
    fn resolve(&self, settings: &Settings) -> Result<PathBuf> {
        match &self.env_file {
            Some(path) => Ok(path.clone()),
            None => Ok(settings.env_file(&self.service)?.to_path_buf()),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct SetOptions {
    #[command(flatten)]
    pub target: EnvFileOptions,

    /// Entries to set.
    #[arg(required = true, value_name = "KEY=VALUE", value_parser = parse_entry)]
    pub entries: Vec<(String, String)>,
}

#[derive(Args, Clone, Debug)]
struct DeleteOptions {
    #[command(flatten)]
    pub target: EnvFileOptions,

    /// Keys to delete.
    #[arg(required = true, value_name = "KEY")]
    pub keys: Vec<String>,
}

#[derive(Args, Clone, Debug)]
struct TargetOptions {
    /// Base URL of proxy admin API.
    #[arg(short, long, value_name = "url")]
    pub admin_url: Option<String>,
}

impl TargetOptions {
    fn resolve(&self, settings: &Settings) -> ProxyTarget {
        match &self.admin_url {
            Some(url) => ProxyTarget::new(url),
            None => ProxyTarget::new(&settings.proxy.admin_url),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct LoadOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Path to JSON configuration to load.
    #[arg(short = 'f', long, value_name = "path")]
    pub config_file: PathBuf,
}

fn parse_entry(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        }
        _ => Err(format!("expected KEY=VALUE, got {entry:?}")),
    }
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn read_env_file(path: &Path) -> Result<EnvFile> {
    match read_to_string(path) {
        Ok(content) => content
            .parse()
            .with_context(|| format!("failed to parse {:?}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(EnvFile::new()),
        Err(err) => Err(err).with_context(|| format!("failed to read {:?}", path.display())),
    }
}

fn writer() -> ConfigWriter {
    ConfigWriter::new().with_logger(Arc::new(TracingLogger))
}

fn run_conf_list(settings: &Settings, opts: EnvFileOptions) -> Result<()> {
    let path = opts.resolve(settings)?;
    if !path.exists() {
        return Err(anyhow!("environment file {:?} does not exist", path.display()));
    }

    for (key, value) in read_env_file(&path)?.iter() {
        println!("{key}={value}");
    }

    Ok(())
}

fn run_conf_set(settings: &Settings, opts: SetOptions) -> Result<()> {
    let path = opts.target.resolve(settings)?;
    let mut env = read_env_file(&path)?;
    for (key, value) in opts.entries {
        env.set(&key, value)?;
    }

    writer().write(&path, env.as_map())?;
    info!("updated {:?}", path.display());

    Ok(())
}

fn run_conf_delete(settings: &Settings, opts: DeleteOptions) -> Result<()> {
    let path = opts.target.resolve(settings)?;
    let mut env = read_env_file(&path)?;
    let mut removed = 0;
    for key in opts.keys {
        match env.remove(&key) {
            Some(_) => removed += 1,
            None => warn!("key {key:?} not found in {:?}", path.display()),
        }
    }

    if removed == 0 {
        return Ok(());
    }

    writer().write(&path, env.as_map())?;
    info!("removed {removed} entries from {:?}", path.display());

    Ok(())
}

fn publisher(settings: &Settings) -> Result<Publisher> {
    Ok(Publisher::new(PublisherConfig::from(&settings.proxy))?.with_logger(Arc::new(TracingLogger)))
}

async fn run_proxy_load(settings: &Settings, opts: LoadOptions) -> Result<()> {
    let target = opts.target.resolve(settings);
    publisher(settings)?
        .publish(&target, Payload::File(opts.config_file.clone()))
        .await?;
    info!(
        "loaded {:?} into proxy at {}",
        opts.config_file.display(),
        target.admin_url()
    );

    Ok(())
}

async fn run_proxy_status(settings: &Settings, opts: TargetOptions) -> Result<()> {
    let target = opts.resolve(settings);
    if publisher(settings)?.is_ready(&target).await {
        info!("proxy is running at {}", target.admin_url());
    } else {
        warn!("proxy is not running at {}", target.admin_url());
    }

    Ok(())
}

async fn run_proxy_stop(settings: &Settings, opts: TargetOptions) -> Result<()> {
    let target = opts.resolve(settings);
    publisher(settings)?.stop(&target).await?;
    info!("stopped proxy at {}", target.admin_url());

    Ok(())
}
