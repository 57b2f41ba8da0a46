use anyhow::{bail, Context, Result};
use clap::Parser;
use gdbadapter::inferior::{StreamError, DEFAULT_RECV_TIMEOUT, READ_CHUNK};
use gdbadapter::{Config, Debugger, InferiorIo, ResultRecord, Target};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gdbpilot")]
#[command(about = "Script GDB sessions over the machine interface")]
#[command(version)]
struct Cli {
    /// Process id to attach to, or executable to load
    target: String,

    /// MI command to execute after loading; may be repeated
    #[arg(short = 'c', long = "command", value_name = "MI_COMMAND", allow_hyphen_values = true)]
    commands: Vec<String>,

    /// Read memory and print it as hex, e.g. 0x401000:16
    #[arg(long = "read", value_name = "ADDR:SIZE")]
    reads: Vec<String>,

    /// Run the program and relay its output; arguments follow `--`
    #[arg(long)]
    run: bool,

    /// Program arguments for --run
    #[arg(last = true)]
    args: Vec<String>,

    /// JSON config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// GDB executable
    #[arg(long, env = "GDBPILOT_GDB")]
    gdb: Option<PathBuf>,

    /// Per-command timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?.with_env()?,
            None => Config::from_env()?,
        };
        if let Some(gdb) = &self.gdb {
            config.gdb_path = gdb.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.exec_timeout_ms = timeout_ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("gdbpilot", level)
        .with_module_level("gdbadapter", level)
        .init()
        .context("failed to initialize logger")?;

    let config = cli.config()?;
    let target: Target = cli.target.parse()?;
    log::info!("gdbpilot: debugging {}", target);

    let debugger = gdbadapter::process(target, &config)
        .await
        .context("failed to start debugging session")?;

    let exited = Arc::new(AtomicBool::new(false));
    let exit_flag = exited.clone();
    debugger.on_stop(move |reason, payload| {
        log::info!("Inferior stopped: {:?}", reason);
        log::debug!("Stop details: {}", json!(payload));
        if reason.is_some_and(|r| r.is_exit()) {
            exit_flag.store(true, Ordering::SeqCst);
        }
    });

    let outcome = session(&cli, &debugger, exited).await;
    debugger.shutdown().await?;
    outcome
}

async fn session(cli: &Cli, debugger: &Debugger, exited: Arc<AtomicBool>) -> Result<()> {
    for command in &cli.commands {
        match debugger.controller().exec_default(command).await? {
            Some(result) => println!("{}", result_json(command, &result)),
            None => bail!("no answer from GDB to '{}'", command),
        }
    }

    for read in &cli.reads {
        let (address, size) = parse_read(read)?;
        let bytes = debugger.memory().strict().read(address, size).await?;
        println!("{:#x}: {}", address, hex::encode(&bytes));
    }

    if cli.run {
        let io = debugger.run(&cli.args).await?;
        tokio::task::spawn_blocking(move || relay(io, &exited)).await??;
    }

    Ok(())
}

fn result_json(command: &str, result: &ResultRecord) -> serde_json::Value {
    json!({
        "command": command,
        "token": result.token,
        "class": result.class.as_str(),
        "payload": result.payload,
    })
}

fn parse_read(arg: &str) -> Result<(u64, usize)> {
    let (address, size) = arg
        .split_once(':')
        .with_context(|| format!("expected ADDR:SIZE, got '{arg}'"))?;
    let address = match address.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => address.parse(),
    }
    .with_context(|| format!("invalid address '{address}'"))?;
    let size = size
        .parse()
        .with_context(|| format!("invalid size '{size}'"))?;
    Ok((address, size))
}

/// Copy the inferior's output to stdout until it exits or closes its terminal
fn relay(mut io: InferiorIo, exited: &AtomicBool) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        match io.recv(READ_CHUNK, DEFAULT_RECV_TIMEOUT) {
            Ok(chunk) if chunk.is_empty() => {
                if exited.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
            Ok(chunk) => {
                stdout.write_all(&chunk)?;
                stdout.flush()?;
            }
            Err(StreamError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
