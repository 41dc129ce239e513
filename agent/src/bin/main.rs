use std::{path::Path, time::Duration};

use anyhow::Context;
use apmon::{ApMon, MonitorSettings, Param, monitor::DEFAULT_SYS_CLUSTER};
use apmon_agent::{config, init_logger, value::parse_value};
use apmon_procfs::ProcfsCollector;
use clap::Parser;
use cli::{Cli, Command, ConfigCommand};

/// Main agent function.
///
/// About errors: we use `anyhow::Result` and `context` instead of `expect` to get
/// nicer error messages (`expect` prints errors with `Debug`).
fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();
    let config_path = Path::new(&args.config);

    match args.command.unwrap_or(Command::Run(cli::RunArgs::default())) {
        Command::Config(cli::ConfigArgs {
            command: ConfigCommand::Regen,
        }) => {
            let content = config::AgentConfig::default().to_toml()?;
            std::fs::write(config_path, content)
                .with_context(|| format!("could not write the config to {}", config_path.display()))?;
            log::info!("Default configuration file written to: {}", config_path.display());
        }
        Command::Send(send_args) => {
            let config = config::load(config_path, !args.no_default_config).context("could not load config file")?;
            send(&config, send_args)?;
        }
        Command::Run(run_args) => {
            let config = config::load(config_path, !args.no_default_config).context("could not load config file")?;
            run(config, run_args)?;
        }
    }
    Ok(())
}

/// Sends one parameter and stops.
fn send(config: &config::AgentConfig, args: cli::SendArgs) -> anyhow::Result<()> {
    let value = parse_value(&args.value, args.kind)?;
    // the configured limits apply, but nothing is monitored in the background
    let settings = MonitorSettings {
        job_monitoring: false,
        sys_monitoring: false,
        general_info: false,
        conf_recheck: false,
        ..config.settings.clone()
    };
    let apmon = ApMon::builder(config.source()?)
        .settings(settings)
        .build()
        .context("could not initialize the monitor")?;
    apmon
        .send_parameter(Some(&args.cluster), Some(&args.node), Param::new(args.name, value))
        .context("could not send the parameter")?;
    log::info!("Parameter sent to {} destination(s).", apmon.destinations().len());
    Ok(())
}

/// Monitors the host and the jobs until the duration elapses.
fn run(config: config::AgentConfig, args: cli::RunArgs) -> anyhow::Result<()> {
    log::info!("Starting apmon agent v{}", env!("CARGO_PKG_VERSION"));
    let apmon = ApMon::builder(config.source()?)
        .collector(ProcfsCollector::new())
        .settings(config.settings)
        .build()
        .context("could not initialize the monitor")?;

    if config.sys_cluster.is_some() || config.sys_node.is_some() {
        let cluster = config.sys_cluster.as_deref().unwrap_or(DEFAULT_SYS_CLUSTER);
        let node = config.sys_node.as_deref().unwrap_or(apmon.ip_address());
        apmon.set_sys_mon_cluster_node(cluster, node);
    }
    for job in config.jobs {
        apmon
            .add_job_to_monitor(job.pid, job.workdir, job.cluster.as_deref(), job.node.as_deref())
            .with_context(|| format!("cannot monitor process {}", job.pid))?;
    }
    for pid in args.pid {
        apmon
            .add_job_to_monitor(pid, None, None, None)
            .with_context(|| format!("cannot monitor process {pid}"))?;
    }
    log::info!(
        "Monitoring {} process(es), sending to {} destination(s).",
        apmon.monitored_jobs().len(),
        apmon.destinations().len()
    );

    match args.duration {
        Some(duration) => std::thread::sleep(duration),
        None => loop {
            // the monitoring runs on a background thread, until the process is killed
            std::thread::sleep(Duration::from_secs(3600));
        },
    }
    log::info!("Stopping.");
    Ok(())
}

/// Agent command-line interface (CLI).
///
/// We use `clap` to parse these options, therefore the structs
/// derive [`clap::Args`] or other clap trait implementations.
mod cli {
    use std::time::Duration;

    use apmon_agent::value::ValueKind;
    use clap::{Args, Parser, Subcommand};

    // NOTE: the doc comment attached to `Cli` is used by clap as the description of
    // the application. It is displayed at the start of the help message.

    /// apmon agent: send host and process statistics to MonALISA-style collectors.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Command>,

        /// Path to the config file.
        #[arg(long, env = "APMON_AGENT_CONFIG", default_value = "apmon-agent.toml", global = true)]
        pub config: String,

        /// If set, the config file must exist, otherwise the agent will fail to start with an error.
        #[arg(long, default_value_t = false, global = true)]
        pub no_default_config: bool,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Run the agent and monitor the system.
        ///
        /// This is the default command.
        Run(RunArgs),

        /// Send one parameter and stop.
        Send(SendArgs),

        /// Manipulate the configuration.
        Config(ConfigArgs),
    }

    #[derive(Args, Default)]
    pub struct RunArgs {
        /// Additional process to monitor, can be repeated.
        #[arg(long)]
        pub pid: Vec<u32>,

        /// Stop after this duration, ex. `10min`. By default, the agent runs until it is killed.
        #[arg(long, value_parser = humantime::parse_duration)]
        pub duration: Option<Duration>,
    }

    #[derive(Args)]
    pub struct SendArgs {
        pub cluster: String,
        pub node: String,
        /// Name of the parameter.
        pub name: String,
        #[arg(allow_hyphen_values = true)]
        pub value: String,

        /// Type of the value.
        #[arg(long = "type", value_enum, default_value_t = ValueKind::Auto)]
        pub kind: ValueKind,
    }

    #[derive(Args)]
    pub struct ConfigArgs {
        #[command(subcommand)]
        pub command: ConfigCommand,
    }

    #[derive(Subcommand)]
    pub enum ConfigCommand {
        /// Regenerate the configuration file and stop.
        ///
        /// If the file exists, it will be overwritten.
        Regen,
    }
}
