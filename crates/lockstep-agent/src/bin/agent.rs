//! Worker process: hosts one agent plugin and serves the orchestrator until it hangs up.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lockstep::{ConnectOptions, ServeOutcome, run_agent};
use lockstep_agent::default_registry;

struct Args {
    name: String,
    agent_type: String,
    addr: SocketAddr,
    connect_attempts: u32,
}

fn usage() {
    eprintln!("Usage: lockstep-agent --name <name> --type <type> --addr <host:port> [--connect-attempts <n>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --name <name>             Agent name announced to the orchestrator");
    eprintln!("  --type <type>             Plugin type to host");
    eprintln!("  --addr <host:port>        Orchestrator address");
    eprintln!("  --connect-attempts <n>    Connection attempts before giving up [default: 3]");
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    lockstep::init_tracing();

    match run(args).await {
        Ok(outcome) => tracing::info!(?outcome, "Agent exiting"),
        Err(e) => {
            tracing::error!("Agent failed: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut name = None;
    let mut agent_type = None;
    let mut addr = None;
    let mut connect_attempts = 3;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--name" => {
                i += 1;
                name = Some(args.get(i).ok_or("--name requires a value")?.clone());
            }
            "--type" => {
                i += 1;
                agent_type = Some(args.get(i).ok_or("--type requires a value")?.clone());
            }
            "--addr" => {
                i += 1;
                let value = args.get(i).ok_or("--addr requires a value")?;
                addr = Some(
                    value
                        .parse::<SocketAddr>()
                        .map_err(|e| format!("invalid --addr '{value}': {e}"))?,
                );
            }
            "--connect-attempts" => {
                i += 1;
                let value = args.get(i).ok_or("--connect-attempts requires a value")?;
                connect_attempts = value
                    .parse()
                    .map_err(|_| format!("invalid --connect-attempts '{value}'"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args {
        name: name.ok_or("missing required option: --name")?,
        agent_type: agent_type.ok_or("missing required option: --type")?,
        addr: addr.ok_or("missing required option: --addr")?,
        connect_attempts,
    })
}

async fn run(args: Args) -> anyhow::Result<ServeOutcome> {
    let registry = default_registry();
    if !registry.contains(&args.agent_type) {
        tracing::warn!(agent = %args.name, agent_type = %args.agent_type, "Plugin type not built in");
    }

    let options = ConnectOptions::default()
        .with_attempts(args.connect_attempts)
        .with_backoff(Duration::from_secs(1));
    run_agent(&args.name, args.addr, Arc::new(registry), &options)
        .await
        .with_context(|| format!("agent '{}' at {}", args.name, args.addr))
}
