// Slurm and the signal iterator are Unix-only
#[cfg(not(unix))]
fn main() {
    eprintln!("bips-resubmit is only supported on Unix systems (Linux/macOS).");
    std::process::exit(1);
}

#[cfg(unix)]
mod unix_main {
    use anyhow::{Context, Result, bail};
    use clap::{Parser, Subcommand, builder::styling};
    use env_logger::{Builder, Env};
    use log::{debug, error, info, warn};
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::fs::File;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use slurm_resubmit::config::ResubmitConfig;
    use slurm_resubmit::hpc::execution_wrapper::CommandWrapper;
    use slurm_resubmit::resubmit::scheduler_config::mutate_config_file;
    use slurm_resubmit::resubmit::{
        ResubmitCoordinator, ResubmitLayout, ResubmitSettings, ResultConsolidator,
        SchedulerConfig, UnitKey, resubmit_jobs_completed_on_disk,
    };

    const STYLES: styling::Styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default().bold())
        .usage(styling::AnsiColor::Green.on_default().bold())
        .literal(styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(styling::AnsiColor::Cyan.on_default());

    /// Upper bound on how long the driver sleeps between checks of its monitors
    const MAX_DRIVER_POLL: Duration = Duration::from_secs(5);

    #[derive(Parser, Debug)]
    #[command(name = "bips-resubmit")]
    #[command(
        about = "Automatic resubmission of BIPS Slurm jobs that failed on known transient faults",
        long_about = None
    )]
    #[command(styles = STYLES)]
    struct Cli {
        /// Configuration file. Replaces the system, user and local files.
        #[arg(short, long, global = true)]
        config: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace). Overrides the configuration.
        #[arg(long, global = true)]
        log_level: Option<String>,

        #[command(subcommand)]
        command: Commands,
    }

    #[derive(Subcommand, Debug)]
    enum Commands {
        /// Monitor every unit of a run, resubmit known failures and consolidate the results
        Run {
            /// Units to monitor (YYYYMMDD). Defaults to the DATES of the scheduler configuration.
            #[arg(short, long, num_args = 1..)]
            units: Vec<String>,

            /// Scheduler configuration submitted for the run (repeatable)
            #[arg(short, long)]
            scheduler_config: Vec<PathBuf>,

            /// Trigger source of the run
            #[arg(short, long)]
            trigger_source: Option<String>,

            /// Seconds between polls of a unit's job output
            #[arg(short, long)]
            poll_interval: Option<f64>,

            /// Print the unit reports and consolidation outcome as JSON
            #[arg(long)]
            json: bool,
        },
        /// Exit 0 if every resubmitted unit has produced its results, 1 otherwise
        Check,
        /// Merge the results of resubmitted units into the canonical results
        Consolidate {
            /// Print the outcome as JSON
            #[arg(long)]
            json: bool,
        },
        /// Write a copy of a scheduler configuration narrowed to a single unit
        MutateConfig {
            /// Source configuration
            src: PathBuf,
            /// Destination path
            dst: PathBuf,
            /// Unit to rerun (YYYYMMDD)
            #[arg(short, long)]
            unit: String,
        },
        /// Print the effective configuration as TOML
        ShowConfig,
    }

    pub fn main() {
        let cli = Cli::parse();

        let config = match load_config(&cli) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {:#}", e);
                std::process::exit(1);
            }
        };

        if let Err(e) = init_logging(&config) {
            eprintln!("Error initializing logging: {:#}", e);
            std::process::exit(1);
        }

        let result = match cli.command {
            Commands::Run { json, .. } => run(&config, json),
            Commands::Check => match check(&config) {
                Ok(true) => Ok(()),
                Ok(false) => std::process::exit(1),
                Err(e) => Err(e),
            },
            Commands::Consolidate { json } => consolidate(&config, json),
            Commands::MutateConfig { src, dst, unit } => mutate_config(&src, &dst, &unit),
            Commands::ShowConfig => config
                .to_toml()
                .map(|text| print!("{}", text))
                .map_err(Into::into),
        };

        if let Err(e) = result {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }

    /// Load the configuration, apply command-line overrides, then validate the result
    fn load_config(cli: &Cli) -> Result<ResubmitConfig> {
        let mut config = match &cli.config {
            Some(path) => {
                let mut config = ResubmitConfig::load_from_files(&[path.clone()])?;
                config.apply_overrides(std::env::vars());
                config
            }
            None => ResubmitConfig::load()?,
        };
        if let Some(level) = &cli.log_level {
            config.logging.log_level = level.clone();
        }
        if let Commands::Run {
            units,
            scheduler_config,
            trigger_source,
            poll_interval,
            ..
        } = &cli.command
        {
            if !units.is_empty() {
                config.monitor.units = units.clone();
            }
            if !scheduler_config.is_empty() {
                config.monitor.scheduler_configs = scheduler_config.clone();
            }
            if let Some(source) = trigger_source {
                config.monitor.trigger_source = source.clone();
            }
            if let Some(secs) = poll_interval {
                config.monitor.poll_interval_secs = *secs;
            }
        }
        if let Err(errors) = config.validate() {
            bail!("invalid configuration:\n  {}", errors.join("\n  "));
        }
        Ok(config)
    }

    fn init_logging(config: &ResubmitConfig) -> Result<()> {
        let mut builder =
            Builder::from_env(Env::default().default_filter_or(&config.logging.log_level));
        if let Some(path) = &config.logging.log_file {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        builder.init();
        Ok(())
    }

    fn layout(config: &ResubmitConfig) -> ResubmitLayout {
        ResubmitLayout::new(&config.paths.base_dir, &config.paths.log_root)
    }

    /// Units named in the configuration, or the DATES of its single scheduler configuration
    fn resolve_units(config: &ResubmitConfig) -> Result<Vec<UnitKey>> {
        let tokens = if !config.monitor.units.is_empty() {
            config.monitor.units.clone()
        } else if let [path] = config.monitor.scheduler_configs.as_slice() {
            SchedulerConfig::load(path)?.dates()
        } else {
            Vec::new()
        };
        tokens
            .iter()
            .map(|token| UnitKey::parse(token).map_err(Into::into))
            .collect()
    }

    fn register_termination_flag() -> Result<Arc<AtomicBool>> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut signals =
            Signals::new([SIGTERM, SIGINT]).context("Failed to register signal handlers")?;
        let handler_flag = flag.clone();
        thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}. Stopping unit monitors.", sig);
                handler_flag.store(true, Ordering::SeqCst);
            }
        });
        Ok(flag)
    }

    fn run(config: &ResubmitConfig, json: bool) -> Result<()> {
        let units = resolve_units(config)?;
        let wrapper = Arc::new(CommandWrapper::from_config(&config.wrapper));
        info!(
            "Starting resubmission monitor units={} wrapper={} base_dir={}",
            units.len(),
            wrapper.executable(),
            config.paths.base_dir.display()
        );

        let mut coordinator = ResubmitCoordinator::new(
            ResubmitSettings::from_config(config),
            layout(config),
            wrapper,
        );
        if coordinator.start(&units) == 0 {
            info!("No unit monitors started");
            return Ok(());
        }

        let termination_flag = register_termination_flag()?;
        let sleep = config.monitor.poll_interval().min(MAX_DRIVER_POLL);
        while !coordinator.all_units_done() {
            if termination_flag.load(Ordering::SeqCst) {
                warn!("Termination requested before all units finished");
                break;
            }
            thread::sleep(sleep);
        }

        let reports = coordinator.stop_and_join().to_vec();
        for report in &reports {
            debug!(
                "unit={} resubmitted={} wrapper_exit_code={:?}",
                report.unit, report.resubmitted, report.wrapper_exit_code
            );
        }

        let outcome = coordinator.finalize()?;
        if let Some(outcome) = &outcome {
            info!(
                "Consolidation finished rows_added={} units_rescued={} returncode={:?}",
                outcome.rows_added, outcome.units_rescued.len(), outcome.returncode
            );
        }

        if json {
            let value = serde_json::json!({
                "units": reports,
                "consolidation": outcome,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Ok(())
    }

    /// Whether every resubmitted unit has produced its results
    fn check(config: &ResubmitConfig) -> Result<bool> {
        let completed = resubmit_jobs_completed_on_disk(&layout(config))?;
        info!("Resubmission completed: {}", completed);
        Ok(completed)
    }

    fn consolidate(config: &ResubmitConfig, json: bool) -> Result<()> {
        let consolidator = ResultConsolidator::new(layout(config));
        let outcome = consolidator.consolidate()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else if outcome.already_consolidated {
            println!("Already consolidated");
        } else {
            println!(
                "Added {} rows, rescued {} units, returncode {}",
                outcome.rows_added,
                outcome.units_rescued.len(),
                outcome
                    .returncode
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "unset".to_string())
            );
        }
        Ok(())
    }

    fn mutate_config(src: &Path, dst: &Path, unit: &str) -> Result<()> {
        let unit = UnitKey::parse(unit)?;
        let scoped = mutate_config_file(src, dst, &unit)
            .with_context(|| format!("Failed to scope {} to unit {}", src.display(), unit))?;
        info!(
            "Wrote scoped configuration dst={} job_name={}",
            dst.display(),
            scoped.job_name().unwrap_or_default()
        );
        Ok(())
    }
}

#[cfg(unix)]
fn main() {
    unix_main::main();
}
