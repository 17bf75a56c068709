//! ActionTree CLI Entry Point
//!
//! Runs one workflow document to completion and reports its outcome.
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow
//! actiontree nightly.yaml
//!
//! # Use a config file and override the worker count
//! actiontree nightly.yaml --config engine.yaml --workers 8
//!
//! # Call another start function with arguments
//! actiontree nightly.yaml --function rebuild --args "['core', 'ui']"
//!
//! # Keep a JSON record of the result and print the thread timeline
//! actiontree nightly.yaml --results ./results --timeline
//! ```

use std::env;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use actiontree::execution::{EngineConfig, JobOutcome, JobStatus};
use actiontree::workflow::parser::{document_grammar, load_document};
use actiontree::{Engine, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    document_path: Option<String>,
    config_path: Option<String>,
    workers: Option<usize>,
    max_threads: Option<usize>,
    function: Option<String>,
    args: Option<String>,
    result_dir: Option<String>,
    timeline: bool,
    grammar: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: actiontree [OPTIONS] <DOCUMENT>");
    println!();
    println!("Arguments:");
    println!("  <DOCUMENT>          Path to workflow YAML document");
    println!();
    println!("Options:");
    println!("  --config PATH       Engine configuration file (YAML)");
    println!("  --workers N         Number of worker threads");
    println!("  --max-threads N     Limit on live logical threads, 0 for none");
    println!("  --function NAME     Start function, overrides the document");
    println!("  --args EXPR         Arguments passed to the start function");
    println!("  --results DIR       Write the job result as JSON into DIR");
    println!("  --timeline          Print the thread timeline when done");
    println!("  --grammar           Print the grammar of all elements and exit");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  actiontree nightly.yaml");
    println!("  actiontree nightly.yaml --workers 8 --timeline");
    println!("  actiontree nightly.yaml --function rebuild --args \"['core']\"");
}

fn value_of(args: &[String], i: usize, option: &str) -> Result<String, String> {
    args.get(i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", option))
}

fn number_of(args: &[String], i: usize, option: &str) -> Result<usize, String> {
    let value = value_of(args, i, option)?;
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", option, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--timeline" => config.timeline = true,
            "--grammar" => config.grammar = true,
            "--config" => {
                i += 1;
                config.config_path = Some(value_of(args, i, arg)?);
            }
            "--workers" => {
                i += 1;
                config.workers = Some(number_of(args, i, arg)?);
            }
            "--max-threads" => {
                i += 1;
                config.max_threads = Some(number_of(args, i, arg)?);
            }
            "--function" => {
                i += 1;
                config.function = Some(value_of(args, i, arg)?);
            }
            "--args" => {
                i += 1;
                config.args = Some(value_of(args, i, arg)?);
            }
            "--results" => {
                i += 1;
                config.result_dir = Some(value_of(args, i, arg)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.document_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.document_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.document_path.is_none() && !config.grammar {
        return Err("No workflow document given".to_string());
    }
    Ok(config)
}

/// Engine settings from the config file with command-line overrides.
fn engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = config.workers {
        engine_config = engine_config.with_workers(workers);
    }
    if let Some(limit) = config.max_threads {
        engine_config = engine_config.with_max_live_threads(limit);
    }
    if let Some(dir) = &config.result_dir {
        engine_config = engine_config.with_result_dir(dir);
    }
    engine_config.validate()?;
    Ok(engine_config)
}

/// Prints the final status line and details of a job.
fn print_outcome(outcome: &JobOutcome) {
    let status = outcome.status.to_string();
    let status = match outcome.status {
        JobStatus::Normal => status.green().bold(),
        JobStatus::Terminated => status.yellow().bold(),
        JobStatus::Abnormal | JobStatus::Unknown => status.red().bold(),
    };
    let end_code = outcome
        .end_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!();
    println!("Status:   {} (end code {})", status, end_code);
    if !outcome.result.is_null() {
        println!("Result:   {}", outcome.result);
    }
    for condition in &outcome.unhandled {
        println!("{} {}", "Unhandled:".red(), condition);
        if let Some(info) = condition.exception_info() {
            if !info.data.is_null() {
                println!("          data {}", info.data);
            }
            if !info.stack_trace.is_empty() {
                println!("          in {}", info.stack_trace.join(" > "));
            }
        }
    }
}

/// Main application entry point.
fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    let engine = Engine::new(engine_config(&config)?)?;

    if config.grammar {
        println!("{}", document_grammar());
        print!("{}", engine.grammar());
        return Ok(ExitCode::SUCCESS);
    }

    // Print banner
    print_banner();

    let Some(path) = config.document_path.as_deref() else {
        return Err("No workflow document given".into());
    };
    info!(
        "Engine: {} workers, machine '{}'",
        engine.config().workers,
        engine.config().machine
    );

    // Load document
    let mut document = load_document(path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", path, e)
    })?;
    if let Some(function) = &config.function {
        document.attributes.insert("start".to_string(), function.clone());
    }
    if let Some(args) = &config.args {
        document.attributes.insert("args".to_string(), args.clone());
    }

    // Submit and wait
    let job = match engine.submit_document(&document, path) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("{} {}", "Rejected:".red().bold(), e);
            if let Some(payload) = e.payload() {
                eprintln!("{}", serde_json::to_string(&payload)?);
            }
            let code = u8::try_from(e.status_code()).unwrap_or(u8::MAX);
            return Ok(ExitCode::from(code));
        }
    };
    info!("Job {} '{}' submitted", job.number(), job.name());
    job.wait();

    let Some(outcome) = job.outcome() else {
        return Err(format!("Job {} finished without an outcome", job.number()).into());
    };
    print_outcome(&outcome);

    if config.timeline {
        println!();
        println!("{}", job.timeline().gantt_chart());
    }

    engine.shutdown();
    Ok(match outcome.status {
        JobStatus::Normal => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
