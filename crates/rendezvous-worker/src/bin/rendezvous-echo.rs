use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rendezvous_worker::{Echo, WorkerConfig, init_tracing, serve};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args, WorkerConfig::from_env()) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: rendezvous-echo [--socket-dir <dir>] [--auth-timeout <secs>]");
            eprintln!();
            eprintln!("Echoes every byte received on stdin and on each cloned connection.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --socket-dir <dir>      Directory for the rendezvous socket [default: /tmp]");
            eprintln!("  --auth-timeout <secs>   Time a clone has to present its token [default: 10]");
            process::exit(2);
        }
    };

    init_tracing();
    tracing::debug!(?config, "Starting echo worker");

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(serve(config, Arc::new(Echo)));
    // Clone contexts may still be parked on their sockets; don't wait for them.
    runtime.shutdown_background();
    result.context("echo worker failed")
}

fn parse_args(args: &[String], mut config: WorkerConfig) -> Result<WorkerConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--socket-dir" => {
                i += 1;
                let dir = args.get(i).ok_or("--socket-dir requires a value")?;
                config = config.with_socket_dir(PathBuf::from(dir));
            }
            "--auth-timeout" => {
                i += 1;
                let secs = args.get(i).ok_or("--auth-timeout requires a value")?;
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| format!("invalid --auth-timeout '{secs}'"))?;
                config = config.with_auth_timeout(Duration::from_secs(secs));
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}
