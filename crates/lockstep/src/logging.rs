//! Tracing setup shared by the `lockstep` orchestrator and `lockstep-agent` workers.
//!
//! Workers inherit stderr from the orchestrator, so both ends log there and their lines
//! interleave in one stream. `LOCKSTEP_LOG` picks a level for this workspace's crates;
//! `RUST_LOG` replaces the whole filter when set.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn level_name(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn workspace_directives(level: &str) -> String {
    format!("lockstep={level},lockstep_agent={level}")
}

/// Install the global subscriber. Later calls are no-ops.
///
/// `LOG_FORMAT=json` switches to one JSON object per line.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_name(std::env::var("LOCKSTEP_LOG").ok().as_deref());
        EnvFilter::new(workspace_directives(level))
    };

    let layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
}
