// Sentinel Gateway - Main Entry Point
//
// Command-line front end for the execution gateway:
// - exec: run one submission through the full pipeline
// - scan: risk assessment only
// - directive: operator commands (/status, /container cleanup, ...)
// - batch: newline-delimited JSON requests in, responses out
// - show-config: print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sentinel_gateway::analysis::SecurityAnalyzer;
use sentinel_gateway::config::Config;
use sentinel_gateway::gateway::Gateway;
use sentinel_gateway::policy::SecurityLevel;
use sentinel_gateway::submission::{CodeSubmission, ExecutionRequest, GatewayResponse};
use sentinel_gateway::{logging, metrics_server};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Sentinel: policy-driven code execution gateway
#[derive(Parser, Debug)]
#[command(name = "sentinel")]
#[command(author = "Sentinel Gateway Contributors")]
#[command(version)]
#[command(about = "Risk-assessed, sandboxed and audited code execution", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/sentinel-gateway/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute code through the gateway
    Exec {
        /// Language tag (python, javascript, bash)
        #[arg(short, long)]
        language: String,

        /// Source text; read from --file or stdin when omitted
        code: Option<String>,

        /// Read source from a file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Requested security level (maximum, balanced, development)
        #[arg(short, long)]
        security_level: Option<SecurityLevel>,

        /// Run repeatedly and report timing statistics (max 100)
        #[arg(long)]
        benchmark: Option<u32>,

        /// Record the quantum flag on the audit entry
        #[arg(long)]
        quantum: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assess risk without executing
    Scan {
        /// Language tag
        #[arg(short, long)]
        language: String,

        /// Source text; read from --file or stdin when omitted
        code: Option<String>,

        /// Read source from a file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,
    },
    /// Run an operator directive such as "/status"
    Directive {
        /// Directive text
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Execute newline-delimited JSON requests
    Batch {
        /// Input file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Submissions executed at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Serve Prometheus metrics while running
        #[arg(long)]
        metrics: bool,

        /// Metrics port (overrides configuration)
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    logging::init(&config.logging, args.verbose)?;
    info!("Sentinel gateway v{} starting", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scan { language, code, file } => {
            let code = read_source(code, file).await?;
            let assessment = SecurityAnalyzer::new().analyze(&code, &language);
            println!("{}", serde_json::to_string_pretty(&assessment)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exec {
            language,
            code,
            file,
            security_level,
            benchmark,
            quantum,
            json,
        } => {
            let code = read_source(code, file).await?;
            let mut submission = CodeSubmission::new(language, code).with_quantum(quantum);
            if let Some(level) = security_level {
                submission = submission.with_security_level(level);
            }
            if let Some(iterations) = benchmark {
                submission = submission.with_benchmark(iterations);
            }

            let gateway = Gateway::from_config(&config).await?;
            let response = gateway.execute(submission).await;
            report(&response, json)?;
            Ok(exit_code(&response))
        }
        Commands::Directive { text } => {
            let gateway = Gateway::from_config(&config).await?;
            let response = gateway.execute(CodeSubmission::directive(text.join(" "))).await;
            report(&response, false)?;
            Ok(exit_code(&response))
        }
        Commands::Batch {
            input,
            concurrency,
            metrics,
            metrics_port,
        } => {
            let gateway = Gateway::from_config(&config).await?;

            let server = if metrics || config.metrics.enabled {
                let port = metrics_port.unwrap_or(config.metrics.port);
                let listener = metrics_server::bind(&config.metrics.bind, port).await?;
                Some(tokio::spawn(metrics_server::serve(listener)))
            } else {
                None
            };

            let failures = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open {:?}", path))?;
                    run_batch(gateway, file, concurrency).await?
                }
                None => run_batch(gateway, tokio::io::stdin(), concurrency).await?,
            };

            if let Some(server) = server {
                server.abort();
            }
            Ok(if failures == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

/// Source from the argument, a file, or stdin
async fn read_source(code: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    if let Some(path) = file {
        return tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read source from {:?}", path));
    }
    let mut source = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut source)
        .await
        .context("Failed to read source from stdin")?;
    Ok(source)
}

fn report(response: &GatewayResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    print!("{}", response.stdout);
    if !response.stdout.is_empty() && !response.stdout.ends_with('\n') {
        println!();
    }
    if !response.stderr.is_empty() {
        eprintln!("{}", response.stderr.trim_end());
    }
    if let Some(benchmark) = &response.benchmark {
        eprintln!(
            "benchmark: {} runs, mean {:.2}ms, min {:.2}ms, max {:.2}ms, std dev {:.2}ms, {:.0}% success",
            benchmark.iterations,
            benchmark.mean_ms,
            benchmark.min_ms,
            benchmark.max_ms,
            benchmark.std_dev_ms,
            benchmark.success_rate * 100.0
        );
    }
    eprintln!(
        "[{}] backend={} isolation={} risk={} time={:.3}s memory={}B",
        response.execution_id,
        response.backend,
        response.security_level,
        response
            .risk_assessment
            .as_ref()
            .map(|a| a.risk_level().to_string())
            .unwrap_or_else(|| "n/a".to_string()),
        response.elapsed_time,
        response.memory_used
    );
    Ok(())
}

fn exit_code(response: &GatewayResponse) -> ExitCode {
    if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Execute each request line, printing responses in input order
///
/// Returns the number of failed or unparseable lines.
async fn run_batch<R>(gateway: Arc<Gateway>, input: R, concurrency: usize) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut lines = BufReader::new(input).lines();
    let mut pending = Vec::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read batch input")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: ExecutionRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed request");
                pending.push(Err(serde_json::json!({ "line": line_no, "error": e.to_string() })));
                continue;
            }
        };

        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .context("Batch semaphore closed")?;
        let execution = gateway.execute(request.into());
        pending.push(Ok(tokio::spawn(async move {
            let response = execution.await;
            drop(permit);
            response
        })));
    }

    let mut failures = 0;
    for item in pending {
        let value = match item {
            Ok(handle) => {
                let response = handle.await.context("Batch execution task failed")?;
                if !response.success {
                    failures += 1;
                }
                serde_json::to_value(&response)?
            }
            Err(error) => {
                failures += 1;
                error
            }
        };
        println!("{}", serde_json::to_string(&value)?);
    }

    info!(lines = line_no, failures, "Batch finished");
    Ok(failures)
}
