use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rdmx_app::{spawn_shutdown_watcher, AppConfig, LineFeed};
use rdmx_lambda::{LambdaClient, LambdaCode, LambdaServer};
use rdmx_modes::{
    run_read_client, run_read_server, run_send_recv_client, run_send_recv_server,
    run_write_client, run_write_server,
};
use rdmx_verbs::{ConnectionContext, ControlListener, Mode, Provider, Role, ShutdownSignal};

/// How long a stopping session may take to tear down after a signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_LAMBDA_INPUT: &str = "Test STRING which will be Made upperCASE";

/// RDMA communication over a Reliable Connection queue pair
#[derive(Parser, Debug)]
#[command(name = "rdmx", version, about)]
struct Args {
    /// send, write, read or lambda
    #[arg(required_unless_present = "dump_default_config")]
    mode: Option<Mode>,

    /// Server to connect to. Runs as the server when omitted.
    host: Option<String>,

    /// Path to configuration file
    #[arg(short, long, env = "RDMX_CONFIG")]
    config: Option<PathBuf>,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Handshake TCP port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// RDMA device name (overrides the config file)
    #[arg(short, long)]
    device: Option<String>,

    /// Lambda client: flat binary holding the function's machine code
    #[arg(long)]
    code: Option<PathBuf>,

    /// Lambda client: function name sent with the request
    #[arg(long, default_value = "process_data")]
    function: String,

    /// Lambda client: entry point offset into the code, decimal or 0x hex
    #[arg(long, default_value = "0", value_parser = parse_offset)]
    entry_offset: u64,

    /// Lambda client: input string (sent NUL-terminated)
    #[arg(long, default_value = DEFAULT_LAMBDA_INPUT)]
    input: String,
}

fn parse_offset(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid offset {s:?}: {e}"))
}

impl Args {
    fn role(&self) -> Role {
        if self.host.is_some() {
            Role::Client
        } else {
            Role::Server
        }
    }

    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.handshake.port = port;
        }
        if let Some(device) = &self.device {
            config.rdma.device_name = Some(device.clone());
        }
    }
}

/// What the session thread needs, moved in one piece.
struct Job {
    mode: Mode,
    host: Option<String>,
    config: AppConfig,
    lambda: Option<(LambdaCode, Vec<u8>)>,
    shutdown: ShutdownSignal,
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();

    if args.dump_default_config {
        print!("{}", AppConfig::default().to_toml_string()?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::default(),
    };
    args.apply_overrides(&mut config);
    config.validate()?;

    let _guard = rdmx_logging::init_logging(&config.log)?;
    let mode = args.mode.ok_or_else(|| anyhow!("a mode is required"))?;
    let role = args.role();
    print_banner(mode, role, &config);

    // Load the code before connecting so a bad path fails fast.
    let lambda = match (mode, role) {
        (Mode::Lambda, Role::Client) => {
            let path = args
                .code
                .as_ref()
                .context("the lambda client needs --code <FILE>")?;
            let code = LambdaCode::from_file(path, &args.function, args.entry_offset)?;
            let mut input = args.input.clone().into_bytes();
            input.push(0);
            Some((code, input))
        }
        _ => None,
    };

    match &args.host {
        Some(host) => println!("Connecting to {host}..."),
        None => println!("Starting server..."),
    }

    let shutdown = ShutdownSignal::new();
    let mut watcher = spawn_shutdown_watcher(shutdown.clone());
    let job = Job {
        mode,
        host: args.host.clone(),
        config,
        lambda,
        shutdown: shutdown.clone(),
    };
    let mut session = tokio::task::spawn_blocking(move || run_job(job));

    let joined = tokio::select! {
        joined = &mut session => joined,
        _ = &mut watcher => {
            tracing::info!("shutdown requested, waiting for the session to stop");
            tokio::time::timeout(SHUTDOWN_GRACE, &mut session)
                .await
                .map_err(|_| anyhow!("session did not stop within {SHUTDOWN_GRACE:?}"))?
        }
    };
    watcher.abort();

    let result = joined.context("session thread panicked")?;
    if let Err(e) = &result {
        tracing::error!(error = %e, %mode, %role, "session failed");
    }
    result
}

fn print_banner(mode: Mode, role: Role, config: &AppConfig) {
    let role = match role {
        Role::Server => "Server",
        Role::Client => "Client",
    };
    println!();
    println!("=== RDMA Communication Program Started ===");
    println!("Mode: {mode} ({role})");
    println!("Configuration:");
    println!("  Buffer size: {} bytes", config.rdma.buffer_size);
    println!("  IB port: {}", config.rdma.ib_port);
    println!("  GID index: {}", config.rdma.gid_index);
    println!("  TCP port: {}", config.handshake.port);
    let _ = io::stdout().flush();
}

#[cfg(feature = "rdma")]
fn run_job(job: Job) -> anyhow::Result<()> {
    run_on(rdmx_verbs::IbvProvider::new(), job)
}

#[cfg(not(feature = "rdma"))]
fn run_job(_job: Job) -> anyhow::Result<()> {
    Err(rdmx_verbs::RdmaError::Unsupported.into())
}

/// Connects and runs one mode to completion. Dropping the session on the way
/// out releases every verbs resource.
#[cfg_attr(not(feature = "rdma"), allow(dead_code))]
fn run_on<P: Provider>(provider: P, job: Job) -> anyhow::Result<()> {
    let Job {
        mode,
        host,
        config,
        lambda,
        shutdown,
    } = job;

    let ctx = ConnectionContext::initialize(provider, mode, &config.rdma)?;
    let established = match &host {
        Some(host) => ctx.connect(host, &config.handshake, &shutdown),
        None => {
            let listener = ControlListener::bind(&config.handshake)?;
            tracing::info!(addr = %listener.local_addr(), "waiting for a client");
            ctx.accept(listener, &shutdown)
        }
    };
    let mut session = match established {
        Ok(session) => session,
        Err(e) if e.is_cancelled() => {
            tracing::info!("stopped before a peer connected");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let lines = || LineFeed::stdin(shutdown.clone());
    let stats = match (mode, host.is_some()) {
        (Mode::SendRecv, false) => run_send_recv_server(&mut session, &mut out)?,
        (Mode::SendRecv, true) => run_send_recv_client(&mut session, lines()?, &mut out)?,
        (Mode::Write, false) => run_write_server(&mut session, &mut out)?,
        (Mode::Write, true) => run_write_client(&mut session, lines()?, &mut out)?,
        (Mode::Read, false) => run_read_server(&mut session, lines()?, &mut out)?,
        (Mode::Read, true) => run_read_client(&mut session, lines()?, &mut out)?,
        (Mode::Lambda, false) => {
            let mut server = LambdaServer::new(session, &config.lambda)?;
            writeln!(out, "Lambda Server ready.")?;
            out.flush()?;
            server.run()?;
            return Ok(());
        }
        (Mode::Lambda, true) => {
            let (code, input) = lambda.context("lambda request was not prepared")?;
            let mut client = LambdaClient::new(session, &config.lambda)?;
            let result = match client.execute(&code, &input) {
                Err(e) if e.is_cancelled() => return Ok(()),
                other => other?,
            };
            if result.is_success() {
                writeln!(
                    out,
                    "Processed output ({} bytes): {}",
                    result.output_size,
                    result.output_str()
                )?;
                return Ok(());
            }
            writeln!(out, "Execution failed with error: {}", result.status)?;
            bail!("remote execution returned status {}", result.status);
        }
    };
    tracing::info!(
        %mode,
        messages = stats.messages,
        bytes = stats.bytes,
        "session finished"
    );
    Ok(())
}
