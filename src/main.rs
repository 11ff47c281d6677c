use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use onlycode::api::{self, ApiState, RunResponse};
use onlycode::config::{DockerConfig, OrchestratorConfig, SandboxLimits};
use onlycode::orchestrator::{ExecutionRequest, ExecutionResult, ExecutionStatus, Orchestrator};
use onlycode::runtime::DockerRuntime;
use onlycode::shutdown::shutdown_token;

/// Exit status used by `run` when the program hit its deadline, as timeout(1) does.
const TIMED_OUT_EXIT_CODE: i32 = 124;

#[derive(Parser, Debug)]
#[command(name = "onlycode")]
#[command(version)]
#[command(about = "Runs untrusted code submissions in ephemeral Docker containers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Server(ServerArgs),

    /// Execute a single file and print the result
    Run(RunArgs),
}

// =============================================================================
// Arguments
// =============================================================================

/// Orchestrator settings shared by every subcommand.
#[derive(clap::Args, Debug)]
struct OrchestratorArgs {
    /// Path of the Docker daemon socket
    #[arg(long, env = "ONLYCODE_DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    docker_socket: String,

    /// Docker API version to speak, <major>.<minor>
    #[arg(long, env = "ONLYCODE_DOCKER_API_VERSION", default_value = "1.41")]
    docker_api_version: String,

    /// Pull images that are missing locally
    #[arg(long, env = "ONLYCODE_PULL_IMAGES")]
    pull_images: bool,

    /// Default wall-clock deadline per execution
    #[arg(long, env = "ONLYCODE_TIMEOUT_MS", default_value = "10000")]
    timeout_ms: u64,

    /// Upper bound for deadlines requested by callers
    #[arg(long, env = "ONLYCODE_MAX_TIMEOUT_MS", default_value = "60000")]
    max_timeout_ms: u64,

    /// Executions allowed to run at once
    #[arg(long, env = "ONLYCODE_MAX_CONN", default_value = "4")]
    max_conn: usize,

    /// How long a submission may wait for a free slot
    #[arg(long, env = "ONLYCODE_ADMISSION_TIMEOUT_MS", default_value = "30000")]
    admission_timeout_ms: u64,

    /// Bound on individual Docker API calls
    #[arg(long, env = "ONLYCODE_API_TIMEOUT_MS", default_value = "5000")]
    api_timeout_ms: u64,

    /// Largest accepted source payload
    #[arg(long, env = "ONLYCODE_MAX_SOURCE_BYTES", default_value = "65536")]
    max_source_bytes: usize,

    /// Per-stream ceiling for captured output
    #[arg(long, env = "ONLYCODE_OUTPUT_LIMIT_BYTES", default_value = "65536")]
    output_limit_bytes: usize,
}

impl OrchestratorArgs {
    fn into_config(self) -> OrchestratorConfig {
        OrchestratorConfig {
            docker: DockerConfig {
                socket_path: self.docker_socket,
                api_version: self.docker_api_version,
                pull_missing_images: self.pull_images,
            },
            timeout: Duration::from_millis(self.timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            max_conn: self.max_conn,
            admission_timeout: Duration::from_millis(self.admission_timeout_ms),
            api_timeout: Duration::from_millis(self.api_timeout_ms),
            max_source_bytes: self.max_source_bytes,
            output_limit_bytes: self.output_limit_bytes,
            limits: SandboxLimits::default(),
            ..OrchestratorConfig::default()
        }
    }
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Port the HTTP API listens on
    #[arg(long, env = "ONLYCODE_HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Directory served under /static
    #[arg(long, env = "ONLYCODE_STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,

    #[command(flatten)]
    orchestrator: OrchestratorArgs,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Source file fed to the program on stdin
    file: PathBuf,

    /// Image to run the program in
    #[arg(long)]
    image: String,

    /// Deadline for this run (defaults to --timeout-ms)
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    #[command(flatten)]
    orchestrator: OrchestratorArgs,

    /// Command to run instead of the image default, after `--`
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(
    config: OrchestratorConfig,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    config.validate()?;
    let runtime = DockerRuntime::connect(&config)?;
    Ok(Orchestrator::new(config, Arc::new(runtime)))
}

fn print_stream(label: &str, text: &str, truncated: bool) {
    if text.is_empty() && !truncated {
        return;
    }
    if truncated {
        println!("{} (truncated):", label);
    } else {
        println!("{}:", label);
    }
    for line in text.lines() {
        println!("  {}", line);
    }
}

fn print_result(result: ExecutionResult, format: &OutputFormat) -> Result<(), serde_json::Error> {
    let response = RunResponse::from(result);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => {
            println!("Submission:  {}", response.submission_id);
            println!("Status:      {}", response.status);
            if let Some(code) = response.exit_code {
                println!("Exit Code:   {}", code);
            }
            println!("Duration:    {} ms", response.duration_ms);
            print_stream("Stdout", &response.stdout, response.stdout_truncated);
            print_stream("Stderr", &response.stderr, response.stderr_truncated);
        }
    }
    Ok(())
}

// =============================================================================
// Subcommands
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = OrchestratorConfig {
        http_port: args.http_port,
        static_dir: args.static_dir,
        ..args.orchestrator.into_config()
    };

    tracing::info!(
        http_port = config.http_port,
        max_conn = config.max_conn,
        timeout_ms = config.timeout.as_millis() as u64,
        docker_api_version = %config.docker.api_version,
        "Starting onlycode server"
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let static_dir = config.static_dir.clone();
    let orchestrator = build_orchestrator(config)?;
    orchestrator.sweep_orphans().await;

    let shutdown = shutdown_token()?;
    let state = ApiState {
        orchestrator: orchestrator.clone(),
    };
    api::serve(addr, state, &static_dir, shutdown).await?;

    orchestrator.close();
    tracing::info!("Server stopped");
    Ok(())
}

async fn run_file(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let source = tokio::fs::read(&args.file).await?;
    let orchestrator = build_orchestrator(args.orchestrator.into_config())?;

    let mut request = ExecutionRequest::new(args.image, source);
    if let Some(ms) = args.deadline_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if !args.command.is_empty() {
        request = request.with_command(args.command);
    }

    match orchestrator.submit(request).await {
        Ok(result) => {
            let code = match (result.status, result.exit_code) {
                (ExecutionStatus::TimedOut, _) => TIMED_OUT_EXIT_CODE,
                (_, Some(code)) => i32::try_from(code).unwrap_or(1),
                (_, None) => 1,
            };
            print_result(result, &args.output)?;
            Ok(code)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Ok(1)
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Run(run_args) => {
            let code = run_file(run_args).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}
