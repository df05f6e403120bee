//! Lynkeus - security header scanner CLI

use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing_subscriber::EnvFilter;
use url::Url;

use lynkeus::config;
use lynkeus::engine::ScanEngine;
use lynkeus::models::{ReportMeta, RiskLevel, ScanJob, ScanResult, StorageItem};
use lynkeus::report;
use lynkeus::rules;
use lynkeus::session::browser::ChromiumFactory;
use lynkeus::session::replay::RecordedScript;

/// Lynkeus - browser-driven security header scanner
#[derive(Parser)]
#[command(name = "lynkeus", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a security header scan against a target
    Scan {
        /// Target URL to scan
        #[arg(short, long)]
        target: String,

        /// Path to a recorded interaction script (Chrome recorder JSON)
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Maximum concurrent browser sessions
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-navigation timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Retry limit for failed navigations
        #[arg(long)]
        retries: Option<u32>,

        /// Custom headers (format: "Key: Value")
        #[arg(short = 'H', long)]
        header: Option<Vec<String>>,

        /// localStorage entries seeded before any page script (key=value)
        #[arg(long)]
        storage: Option<Vec<String>>,

        /// Output file path (default: lynkeus_{hostname}.json)
        #[arg(short, long)]
        output: Option<String>,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Report title stored in the result metadata
        #[arg(long)]
        report_name: Option<String>,

        /// Target system name stored in the result metadata
        #[arg(long)]
        target_system: Option<String>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the bundled security rules
    Rules,

    /// Summarize a previously saved scan result
    Report {
        /// Path to the JSON result file
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "lynkeus=debug" } else { "lynkeus=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════╗
    ║  LYNKEUS v0.1.0                      ║
    ║  Security Header Scanner             ║
    ║  "The keen-sighted one"              ║
    ╚══════════════════════════════════════╝
    "#;
    println!("{}", banner.cyan());
}

fn output_name_from_target(target: &str) -> String {
    if let Ok(url) = Url::parse(target) {
        let host = url.host_str().unwrap_or("unknown");
        let sanitized: String = host
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect();
        format!("lynkeus_{sanitized}.json")
    } else {
        "lynkeus_result.json".to_string()
    }
}

fn risk_label(risk: RiskLevel) -> colored::ColoredString {
    match risk {
        RiskLevel::Critical => risk.to_string().red().bold(),
        RiskLevel::High => risk.to_string().bright_red(),
        RiskLevel::Medium => risk.to_string().yellow(),
        RiskLevel::Low => risk.to_string().blue(),
    }
}

fn print_summary(result: &ScanResult) {
    println!("\n{}", "  Scan Summary".bold());
    println!("  {}", "─".repeat(35));

    let mut builder = Builder::default();
    builder.push_record(["Rule", "Risk", "Pass", "Fail", "Indeterminate"]);
    for summary in &result.summaries {
        builder.push_record([
            summary.v_type.clone(),
            summary.risk.to_string(),
            summary.pass_count.to_string(),
            summary.fail_count.to_string(),
            summary.indeterminate_count.to_string(),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");

    let failing: Vec<String> = [
        RiskLevel::Critical,
        RiskLevel::High,
        RiskLevel::Medium,
        RiskLevel::Low,
    ]
    .iter()
    .map(|risk| format!("{} {}", result.failing_rules_at(*risk), risk))
    .collect();
    println!("\n  {} {}", "Failing rules:".bold(), failing.join(" / "));
    println!(
        "  {} {} ({} responses evaluated)",
        "Overall risk:".bold(),
        risk_label(result.risk_level),
        result.responses_evaluated
    );

    if !result.failed_targets.is_empty() {
        println!("\n  {}", "Unreachable targets:".bold());
        for failed in &result.failed_targets {
            println!(
                "    {} ({} attempts): {}",
                failed.url.yellow(),
                failed.attempts,
                failed.error
            );
        }
    }
}

fn parse_headers(raw: Option<Vec<String>>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for entry in raw.unwrap_or_default() {
        if let Some((key, value)) = entry.split_once(':') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    headers
}

fn parse_storage(raw: Option<Vec<String>>) -> Vec<StorageItem> {
    raw.unwrap_or_default()
        .iter()
        .filter_map(|entry| {
            entry.split_once('=').map(|(name, value)| StorageItem {
                name: name.trim().to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            target,
            script,
            concurrency,
            timeout,
            retries,
            header,
            storage,
            output,
            config: config_path,
            report_name,
            target_system,
            verbose,
        } => {
            init_tracing(verbose);
            print_banner();

            let mut settings = if let Some(ref path) = config_path {
                config::load_config(path)?
            } else {
                let default_path = Path::new("config/default.toml");
                if default_path.exists() {
                    config::load_config(default_path)?
                } else {
                    config::ScanSettings::default()
                }
            };
            config::merge_cli_args(&mut settings, concurrency, timeout, retries);

            let mut job = ScanJob::new(target.clone());
            job.concurrency = settings.concurrency;
            job.headers = parse_headers(header);
            job.local_storage = parse_storage(storage);

            if let Some(ref script_path) = script {
                let raw = std::fs::read_to_string(script_path)?;
                match RecordedScript::from_json(&raw) {
                    Ok(parsed) => job.script = Some(parsed),
                    Err(e) => {
                        eprintln!("  {} {e}", "Error:".red().bold());
                        std::process::exit(1);
                    }
                }
            }

            let today = Local::now().format("%Y-%m-%d").to_string();
            job.report = ReportMeta {
                report_name: report_name.unwrap_or_else(|| "Web security scan".to_string()),
                version: "1.0".to_string(),
                target_system: target_system.unwrap_or_else(|| target.clone()),
                start_date: today.clone(),
                end_date: today,
            };

            println!("  {} {}", "Target:".bold(), target.green());
            println!(
                "  {} {}",
                "Sessions:".bold(),
                job.concurrency.to_string().cyan()
            );
            if job.script.is_some() {
                println!("  {} recorded script replay", "Mode:".bold());
            }
            println!();

            let factory = match ChromiumFactory::new(job.headers.clone(), job.local_storage.clone())
            {
                Ok(factory) => Arc::new(factory),
                Err(e) => {
                    eprintln!("  {} {e}", "Error:".red().bold());
                    std::process::exit(1);
                }
            };

            let engine = ScanEngine::new(factory, settings);

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("  {spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message("Scanning...");
            spinner.enable_steady_tick(Duration::from_millis(120));

            let scan_outcome = engine.run(job).await;
            spinner.finish_and_clear();

            let output_file = output.unwrap_or_else(|| output_name_from_target(&target));
            let output_path = Path::new(&output_file);

            match scan_outcome {
                Ok(result) => {
                    print_summary(&result);
                    report::json::export(&result, output_path)?;
                    println!("\n  {} {}", "Result saved to:".bold(), output_file.green());
                }
                Err(failure) => {
                    eprintln!("\n  {} {}", "Scan failed:".red().bold(), failure.error);
                    print_summary(&failure.partial);
                    report::json::export(&failure.partial, output_path)?;
                    eprintln!(
                        "  {} {}",
                        "Partial results saved to:".bold(),
                        output_file.yellow()
                    );
                    std::process::exit(1);
                }
            }
        }

        Commands::Rules => {
            print_banner();
            println!("  {}\n", "Bundled Security Rules:".bold());
            for rule in rules::catalogue() {
                println!(
                    "    {} {} {}",
                    format!("{:32}", rule.v_type).cyan().bold(),
                    format!("{:8}", rule.risk.to_string()),
                    rule.name
                );
                println!("      checks: {}", rule.check_headers.join(", ").dimmed());
            }
            println!();
        }

        Commands::Report { input } => {
            init_tracing(false);
            print_banner();
            let result = report::json::load(&input)?;
            println!(
                "  {} {} ({})",
                "Target:".bold(),
                result.target.green(),
                result.report.report_name
            );
            print_summary(&result);
        }
    }

    Ok(())
}
