//! World loop: launches one worker per agent and steps a toy track in lock-step.
//!
//! Reads playback commands from stdin (`p`, `speed <x>`, `step [n]`, `q`) and prints
//! the final track state as JSON on stdout.

use std::io::BufRead;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lockstep::{
    AgentConfig, Engine, EngineConfig, PlaybackCommand, PlaybackController, parse_command,
};
use lockstep_agent::Track;

struct Args {
    agents: Vec<AgentConfig>,
    ticks: u64,
    tick_ms: u64,
    dt: f64,
    patience: u32,
    port: Option<u16>,
    agent_bin: Option<PathBuf>,
    paused: bool,
}

fn usage() {
    eprintln!("Usage: lockstep --agent <name>:<type> [--agent ...] [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --agent <name>:<type>   Agent to launch (repeatable)");
    eprintln!("  --ticks <n>             Stop after n iterations, 0 runs until quit [default: 0]");
    eprintln!("  --tick-ms <ms>          Wall time per iteration at speed 1 [default: 100]");
    eprintln!("  --dt <seconds>          Simulated seconds per iteration [default: 0.1]");
    eprintln!("  --patience <n>          Missed iterations before a car is eliminated [default: 3]");
    eprintln!("  --port <port>           Orchestrator port [default: ephemeral]");
    eprintln!("  --agent-bin <path>      Worker executable [default: lockstep-agent]");
    eprintln!("  --paused                Start paused");
    eprintln!();
    eprintln!("Commands on stdin: p (pause/resume), speed <x>, step [n], q");
}

#[tokio::main]
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
    tracing::info!(version = lockstep::LOCKSTEP_VERSION, agents = args.agents.len(), "lockstep starting");

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        agents: Vec::new(),
        ticks: 0,
        tick_ms: 100,
        dt: 0.1,
        patience: 3,
        port: None,
        agent_bin: None,
        paused: false,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--paused" => parsed.paused = true,
            "--help" | "-h" => return Err(String::new()),
            "--agent" | "--ticks" | "--tick-ms" | "--dt" | "--patience" | "--port"
            | "--agent-bin" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                let invalid = || format!("invalid {flag} '{value}'");
                match flag {
                    "--agent" => parsed
                        .agents
                        .push(value.parse().map_err(|e| format!("{e}"))?),
                    "--ticks" => parsed.ticks = value.parse().map_err(|_| invalid())?,
                    "--tick-ms" => parsed.tick_ms = value.parse().map_err(|_| invalid())?,
                    "--dt" => parsed.dt = value.parse().map_err(|_| invalid())?,
                    "--patience" => parsed.patience = value.parse().map_err(|_| invalid())?,
                    "--port" => parsed.port = Some(value.parse().map_err(|_| invalid())?),
                    _ => parsed.agent_bin = Some(PathBuf::from(value)),
                }
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if parsed.agents.is_empty() {
        return Err("at least one --agent is required".to_string());
    }
    Ok(parsed)
}

/// `lockstep-agent` next to this executable, if it was installed alongside.
fn sibling_agent_bin() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.with_file_name(format!("lockstep-agent{}", std::env::consts::EXE_SUFFIX));
    candidate.exists().then_some(candidate)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env(args.agents.clone())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bin) = args.agent_bin {
        config = config.with_agent_bin(bin);
    } else if std::env::var_os("LOCKSTEP_AGENT_BIN").is_none()
        && let Some(bin) = sibling_agent_bin()
    {
        config = config.with_agent_bin(bin);
    }

    let mut engine = Engine::new(config).context("invalid configuration")?;
    let mut track = Track::new(
        args.agents.iter().map(|a| a.name.as_str()),
        args.dt,
        args.patience,
    );

    engine.set_status_map(track.statuses())?;
    let report = engine.initialize().await?;
    tracing::info!(ready = ?report.ready, crippled = ?report.crippled, "Engine ready");

    let controller = Arc::new(PlaybackController::new());
    if args.paused {
        controller.push(PlaybackCommand::TogglePause);
    }
    spawn_command_reader(Arc::clone(&controller));
    let _interrupt = controller.terminate_on(tokio::signal::ctrl_c());

    let base = Duration::from_millis(args.tick_ms);
    let result = world_loop(&mut engine, &mut track, &controller, base, args.ticks).await;
    engine.terminate().await?;
    result?;

    println!("{}", serde_json::to_string_pretty(&track.snapshot())?);
    Ok(())
}

async fn world_loop(
    engine: &mut Engine,
    track: &mut Track,
    controller: &PlaybackController,
    base: Duration,
    ticks: u64,
) -> anyhow::Result<()> {
    loop {
        let status = controller.flush();
        if status.terminated {
            tracing::info!(tick = track.tick(), "Stopping on request");
            break;
        }
        if ticks > 0 && track.tick() >= ticks {
            break;
        }
        if track.alive_count() == 0 {
            tracing::info!(tick = track.tick(), "No cars left on the track");
            break;
        }

        if controller.maybe_step() {
            engine.set_status_map(track.statuses())?;
            let table = engine.run_one_iteration().await?;
            track.apply(table);
            tracing::debug!(
                tick = track.tick(),
                answered = table.len(),
                alive = track.alive_count(),
                "Tick"
            );
        }

        tokio::time::sleep(controller.tick_interval(base)).await;
    }
    Ok(())
}

/// Stdin is read on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_command_reader(controller: Arc<PlaybackController>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => controller.push(command),
                Err(e) => tracing::warn!(input = %line.trim(), error = %e, "Ignoring command"),
            }
        }
    });
}
