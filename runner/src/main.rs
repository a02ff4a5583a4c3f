use clap::{Parser, Subcommand};
use fleet_runner::{
    config::{ConfigErrors, FleetConfig, DEFAULT_CONFIG_PATH},
    descriptor::{decode, DescriptorError, ParameterSet},
    discovery::Discovery,
    dispatch::{DispatchError, DispatchSettings, Dispatcher},
    distributed::util::hostname,
    job::ExecJob,
    publisher::Publisher,
    status::read_status,
    transport::SshTransport,
    worker::{Worker, WorkerError},
};
use std::{
    error::Error as StdError,
    fs, io,
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Distribute parameterized jobs to workers over a shared drive
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the fleet config
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log debug output, overridden by RUST_LOG
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stage parameter sets for a worker and push code and entry point
    Submit {
        worker: String,
        /// YAML files with one parameter set each
        #[arg(required = true)]
        params: Vec<PathBuf>,
        /// Only stage the descriptors
        #[arg(long)]
        no_push: bool,
    },
    /// Stop the jobs of a worker by pushing the entry point without descriptors
    Kill { worker: String },
    /// Summarize results and staged descriptors
    Status,
    /// Run the descriptors addressed to this machine, started by the watcher
    Worker {
        /// Worker identity, defaults to worker.id or the hostname
        #[arg(long)]
        id: Option<String>,
    },
    /// Run parameter sets on this machine and publish the results directly
    Local {
        #[arg(required = true)]
        params: Vec<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Failed to read parameter file {0:?}")]
    ReadParams(PathBuf, #[source] io::Error),
    #[error("Parameter file {0:?} is not a mapping")]
    ParseParams(PathBuf, #[source] DescriptorError),
    #[error("Failed to determine the hostname")]
    Hostname(#[from] nix::Error),
    #[error("Failed to read status")]
    Status(#[source] io::Error),
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli) {
        error!("{e}");
        let mut source = e.source();
        while let Some(cause) = source {
            error!("  caused by: {cause}");
            source = cause.source();
        }

        exit(1)
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = FleetConfig::load(&cli.config)?;
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    match cli.command {
        Commands::Submit {
            worker,
            params,
            no_push,
        } => {
            let jobs = params
                .iter()
                .map(|path| read_params(path))
                .collect::<Result<Vec<_>, _>>()?;
            let staged = dispatcher(&config).submit(&worker, &jobs, !no_push)?;

            info!("Submitted {} jobs to {worker}", staged.len());
        }
        Commands::Kill { worker } => {
            dispatcher(&config).kill(&worker)?;
        }
        Commands::Status => {
            let report = read_status(&config.results_root(), &config.inbox_root())
                .map_err(CliError::Status)?;

            print!("{report}");
        }
        Commands::Worker { id } => {
            let id = match id.or_else(|| config.worker.id.clone()) {
                Some(id) => id,
                None => hostname()?,
            };

            let worker = Worker::new(
                Discovery::new(config.inbox_root(), &id).map_err(WorkerError::from)?,
                Publisher::new(config.results_root()),
                exec_job(&config)?,
            )
            .keep_going(config.worker.keep_going);

            let summary = worker.run()?;
            if !summary.failed.is_empty() {
                error!("{} of {} jobs failed", summary.failed.len(), summary.found);
                exit(1)
            }
        }
        Commands::Local { params } => {
            let worker = Worker::new(
                Discovery::new(config.inbox_root(), "local").map_err(WorkerError::from)?,
                Publisher::new(config.results_root()),
                exec_job(&config)?,
            );

            for path in params.iter() {
                let report = worker.run_job(&read_params(path)?)?;
                info!(
                    "Published {} results to {}",
                    report.artifacts,
                    report.job_path.display()
                );
            }
        }
    }

    Ok(())
}

fn dispatcher(config: &FleetConfig) -> Dispatcher<SshTransport> {
    let transport = SshTransport {
        hosts: config.dispatch.hosts.clone(),
        user: config.dispatch.user.clone(),
        private_key: config.private_key(),
        timeout: config.dispatch.timeout.map(Duration::from_secs),
        skip_hostkey: config.dispatch.skip_hostkey,
    };
    if transport.skip_hostkey {
        warn!("Skipping hostkey check. Known hosts will not be consulted");
    }

    Dispatcher::new(DispatchSettings::from_config(config), transport)
}

fn exec_job(config: &FleetConfig) -> Result<ExecJob, ConfigErrors> {
    config
        .worker
        .job
        .as_ref()
        .map(ExecJob::load)
        .ok_or(ConfigErrors::MissingJob)
}

fn read_params(path: &Path) -> Result<ParameterSet, CliError> {
    let bytes = fs::read(path).map_err(|e| CliError::ReadParams(path.to_path_buf(), e))?;

    decode(&bytes).map_err(|e| CliError::ParseParams(path.to_path_buf(), e))
}
