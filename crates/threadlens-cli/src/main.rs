use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use threadlens_core::{FreezeReport, Freezer, FreezerConfig, Stage, ThreadPlatform, VERSION};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log filter used when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser)]
#[command(name = "threadlens")]
#[command(author = "ThreadLens Team")]
#[command(version = VERSION)]
#[command(about = "Run code while every other thread of the process is frozen", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "THREADLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Prompt and read one line from stdin while all other threads are frozen
    Input {
        /// Text printed before reading
        #[arg(short, long)]
        prompt: Option<String>,
    },

    /// Freeze busy worker threads and check that they stood still
    Demo {
        /// Number of counting workers to spawn
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// How long to hold the freeze (e.g. "200ms", "1s")
        #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
        hold: Duration,
    },

    /// List the threads of this process as the freezer sees them
    Threads,

    /// Generate default configuration file
    GenerateConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "threadlens.toml")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let _guard = match init_logging(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", format!("❌ Failed to initialize logging: {:#}", e).red());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("{}", format!("❌ {:#}", e).red());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::GenerateConfig { output }) => generate_config(&output),
        Some(Commands::Input { prompt }) => {
            let freezer = create_freezer(cli.config.as_deref())?;
            read_input(&freezer, prompt.as_deref())
        }
        Some(Commands::Demo { workers, hold }) => {
            let freezer = create_freezer(cli.config.as_deref())?;
            run_demo(&freezer, workers, hold)
        }
        Some(Commands::Threads) | None => {
            let freezer = create_freezer(cli.config.as_deref())?;
            list_threads(&freezer)
        }
    }
}

fn read_input(freezer: &Freezer, prompt: Option<&str>) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    let line = freezer
        .focus_read_line(prompt, &mut stdin.lock(), &mut stdout.lock())
        .context("Focused read failed")?;

    match line {
        Some(line) => println!("{} {}", "✅ Read:".green(), line),
        None => println!("{}", "⚠️  End of input".yellow()),
    }
    Ok(())
}

fn run_demo(freezer: &Freezer, workers: usize, hold: Duration) -> Result<()> {
    println!("{}", "=== ThreadLens Demo ===".green().bold());

    let stop = Arc::new(AtomicBool::new(false));
    let counts: Vec<Arc<AtomicU64>> = (0..workers).map(|_| Arc::new(AtomicU64::new(0))).collect();
    let handles: Vec<_> = counts
        .iter()
        .map(|count| {
            let (count, stop) = (count.clone(), stop.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    count.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
            })
        })
        .collect();

    // Let the workers get going before freezing them
    thread::sleep(Duration::from_millis(50));

    let total = || -> u64 { counts.iter().map(|c| c.load(Ordering::Relaxed)).sum() };
    let result = freezer.focus_with_report(|| {
        let before = total();
        thread::sleep(hold);
        (before, total())
    });

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        if handle.join().is_err() {
            warn!("Demo worker panicked");
        }
    }

    let ((before, after), report) = result.context("Freeze failed")?;

    println!("  Workers:       {}", workers);
    println!("  Held for:      {}", humantime::format_duration(hold));
    println!("  Count before:  {}", before);
    println!("  Count after:   {}", after);

    if before == after {
        println!("\n{}", "✅ Workers stood still while frozen".green());
    } else {
        println!(
            "\n{}",
            format!("🔥 Workers advanced by {} while frozen", after - before).red()
        );
    }

    print_report(&report);
    Ok(())
}

fn list_threads(freezer: &Freezer) -> Result<()> {
    let platform = freezer.platform();
    let current = platform.current_thread();
    let tids = platform
        .enumerate_threads()
        .context("Failed to enumerate threads")?;

    println!("{} {}", "🔍 Threads:".cyan(), tids.len());
    for tid in tids {
        if tid == current {
            println!("  {} {}", tid, "(caller, never frozen)".dimmed());
        } else {
            println!("  {}", tid);
        }
    }
    Ok(())
}

fn print_report(report: &FreezeReport) {
    println!("\n{}", "=== Freeze Report ===".cyan().bold());
    println!("  Threads:    {}", report.enumerated);
    println!("  Captured:   {}", report.captured);
    println!("  Skipped:    {}", report.skipped);
    println!("  Suspended:  {}", report.suspended);
    println!("  Resumed:    {}", report.resumed);
    println!("  Frozen for: {:?}", report.frozen_for);

    for failure in &report.failures {
        let line = format!(
            "  {} failed for thread {}: {}",
            failure.stage, failure.tid, failure.fault
        );
        match failure.stage {
            Stage::Suspend => println!("{}", line.yellow()),
            Stage::Resume => println!("{}", line.red()),
        }
    }
}

/// Build a freezer from the config file, or defaults when none is given
fn create_freezer(path: Option<&Path>) -> Result<Freezer> {
    let config = match path {
        Some(path) if path.exists() => {
            info!("Loading configuration from: {:?}", path);
            FreezerConfig::load_from_file(path)
                .with_context(|| format!("Failed to load configuration file {:?}", path))?
        }
        Some(path) => {
            warn!("Configuration file not found: {:?}, using defaults", path);
            FreezerConfig::default()
        }
        None => FreezerConfig::default(),
    };

    Freezer::with_config(&config).context("Failed to set up freezer")
}

fn generate_config(output: &Path) -> Result<()> {
    info!("Generating default configuration file: {:?}", output);

    FreezerConfig::default()
        .save_to_file(output)
        .context("Failed to save configuration file")?;

    println!(
        "{}",
        format!("✅ Configuration written to {}", output.display()).green()
    );
    Ok(())
}

/// Initialize logging to stderr, plus a rolling file when `log_dir` is set.
///
/// Logs go to stderr so they never interleave with the prompt on stdout.
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let file_appender = tracing_appender::rolling::daily(dir, "threadlens.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_demo_hold() {
        let cli = Cli::parse_from(["threadlens", "demo", "--workers", "2", "--hold", "1s"]);
        match cli.command {
            Some(Commands::Demo { workers, hold }) => {
                assert_eq!(workers, 2);
                assert_eq!(hold, Duration::from_secs(1));
            }
            _ => panic!("expected demo command"),
        }
    }

    #[test]
    fn test_demo_defaults() {
        let cli = Cli::parse_from(["threadlens", "demo"]);
        match cli.command {
            Some(Commands::Demo { workers, hold }) => {
                assert_eq!(workers, 4);
                assert_eq!(hold, Duration::from_millis(200));
            }
            _ => panic!("expected demo command"),
        }
    }

    #[test]
    fn test_default_log_filter_is_info() {
        assert_eq!(DEFAULT_LOG_FILTER, "info");
        assert!(DEFAULT_LOG_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_parse_input_prompt() {
        let cli = Cli::parse_from(["threadlens", "input", "--prompt", "Enter value:"]);
        match cli.command {
            Some(Commands::Input { prompt }) => assert_eq!(prompt.as_deref(), Some("Enter value:")),
            _ => panic!("expected input command"),
        }
    }

    #[test]
    fn test_generate_config_roundtrip() {
        let path = std::env::temp_dir().join(format!("threadlens-cli-{}.toml", std::process::id()));
        generate_config(&path).unwrap();

        let loaded = FreezerConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, FreezerConfig::default());
    }
}
