//! Built-in agent plugins hosted by the `lockstep-agent` worker.

mod basic;
mod cruise;

pub use basic::{Constant, Faulty, Stall};
pub use cruise::Cruise;

use lockstep::AgentRegistry;

/// Registry with every built-in plugin type.
pub fn default_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry
        .register("constant", |name| Box::new(Constant::new(name)))
        .register("cruise", |name| Box::new(Cruise::new(name)))
        .register("stall", |name| Box::new(Stall::new(name)))
        .register("faulty", |name| Box::new(Faulty::new(name)));
    registry
}
