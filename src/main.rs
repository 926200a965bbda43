use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use colored::*;
use eagleeye::{CancellationToken, Engine, EngineConfig, EntryResult, Options, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn load_options(path: &Path) -> anyhow::Result<Options> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let options = if is_yaml {
        let content = std::fs::read_to_string(path)?;
        Options::from_yaml_str(&content)?
    } else {
        Options::from_toml_file(path)?
    };
    Ok(options)
}

fn progress_line(stage: &Stage) -> String {
    let position = match &stage.current_job {
        Some(job) => format!("{} #{} {}", stage.phase, job.index, job.name),
        None => stage.phase.to_string(),
    };
    format!(
        "{} {}/{} | live {} | open {} | findings {} | errors {}",
        position, stage.done, stage.total, stage.live_hosts, stage.open_ports, stage.findings, stage.errors
    )
}

fn print_summary(result: &EntryResult, stage: &Stage) {
    println!();
    println!("{} {}", "Entry".bright_white().bold(), result.entry_id.bright_cyan());
    println!("State:    {}", stage.state.to_string().bright_yellow());
    println!(
        "Targets:  {} resolved, {} live",
        result.target_count,
        result.live_hosts.len().to_string().bright_green()
    );

    if !result.open_ports.is_empty() {
        println!("{:<40} {:<8} {}", "HOST".bright_white().bold(), "PORT".bright_white().bold(), "SERVICE".bright_white().bold());
        for (host, ports) in &result.open_ports {
            for open in ports {
                println!(
                    "{:<40} {:<8} {}",
                    host.to_string(),
                    format!("{}/tcp", open.port).bright_white(),
                    open.service.as_deref().unwrap_or("unknown").bright_yellow()
                );
            }
        }
    }

    for job in &result.jobs {
        println!(
            "Job {} '{}' ({}): {} templates, {} executed, {} errors, {} findings",
            job.index,
            job.name.bright_cyan(),
            job.kind,
            job.templates,
            job.executed,
            job.errors,
            job.findings.to_string().bright_green()
        );
        for warning in &job.warnings {
            println!("  {} {}", "warning:".bright_yellow(), warning);
        }
    }

    for finding in &result.findings {
        let severity = match finding.severity.to_lowercase().as_str() {
            "critical" | "high" => finding.severity.bright_red(),
            "medium" => finding.severity.bright_yellow(),
            "low" => finding.severity.bright_cyan(),
            _ => finding.severity.white(),
        };
        println!(
            "[{}] [{}] [{}] {} {}",
            finding.template_id.bright_green(),
            finding.protocol,
            severity,
            finding.matched_at,
            if finding.evidence.is_empty() {
                String::new()
            } else {
                format!("[{}]", finding.evidence.join(","))
            }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("eagleeye")
        .version(env!("CARGO_PKG_VERSION"))
        .about("EagleEye: host discovery, port scanning and template-driven checks")
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .help("Scan options file (TOML, or YAML with a .yaml/.yml extension)")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .index(1),
        )
        .arg(
            Arg::new("directory")
                .short('d')
                .long("directory")
                .value_name("DIR")
                .help("Results directory")
                .default_value("./results")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("stop-after")
                .long("stop-after")
                .value_name("SECS")
                .help("Stop the scan after this many seconds, keeping partial results")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECS")
                .help("Progress refresh interval")
                .default_value("1")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the final result as JSON")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .context("missing options file")?;
    let directory = matches
        .get_one::<PathBuf>("directory")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("./results"));
    let interval = matches.get_one::<u64>("interval").copied().unwrap_or(1).max(1);

    let options = load_options(config_path)
        .with_context(|| format!("cannot load options from {}", config_path.display()))?;
    let engine = Engine::new(EngineConfig::default().with_directory(directory))?;
    let entry = Arc::new(engine.new_entry(options).context("invalid scan options")?);

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted, stopping");
                ctx.cancel();
            }
        });
    }
    if let Some(seconds) = matches.get_one::<u64>("stop-after").copied() {
        let entry = Arc::clone(&entry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            entry.stop();
        });
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("invalid progress template")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut runner = {
        let entry = Arc::clone(&entry);
        let ctx = ctx.clone();
        tokio::spawn(async move { entry.run(ctx).await })
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    let outcome = loop {
        tokio::select! {
            joined = &mut runner => break joined.context("entry task failed")?,
            _ = ticker.tick() => spinner.set_message(progress_line(&entry.stage())),
        }
    };
    spinner.finish_and_clear();

    let result = entry.result();
    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result, &entry.stage());
        println!("Artifacts: {}", entry.directory().display().to_string().bright_white());
    }
    engine.close();

    outcome.with_context(|| format!("entry {} did not complete", entry.id()))
}
