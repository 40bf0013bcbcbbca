use std::time::Duration;

use lockstep::{AgentPlugin, AgentStatus, Decision, PluginError};
use serde_json::json;

/// Coasts: zero throttle, zero steering.
pub struct Constant {
    name: String,
}

impl Constant {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AgentPlugin for Constant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _status: &AgentStatus) -> Result<(), PluginError> {
        Ok(())
    }

    async fn run_one_iteration(&mut self, _status: &AgentStatus) -> Result<Decision, PluginError> {
        Ok(Decision::new(json!({ "throttle": 0.0, "steer": 0.0 })))
    }
}

/// Initializes normally, then never answers an iteration.
pub struct Stall {
    name: String,
}

impl Stall {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AgentPlugin for Stall {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _status: &AgentStatus) -> Result<(), PluginError> {
        Ok(())
    }

    async fn run_one_iteration(&mut self, _status: &AgentStatus) -> Result<Decision, PluginError> {
        tracing::warn!(agent = %self.name, "Stalling");
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

/// Fails every iteration.
pub struct Faulty {
    name: String,
    failures: u64,
}

impl Faulty {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: 0,
        }
    }
}

#[async_trait::async_trait]
impl AgentPlugin for Faulty {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _status: &AgentStatus) -> Result<(), PluginError> {
        Ok(())
    }

    async fn run_one_iteration(&mut self, status: &AgentStatus) -> Result<Decision, PluginError> {
        self.failures += 1;
        Err(PluginError::new(format!(
            "sensor fault at tick {} ({} so far)",
            status.tick, self.failures
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn constant_coasts() {
        let mut plugin = Constant::new("car-0");
        let decision = plugin
            .run_one_iteration(&AgentStatus::default())
            .await
            .unwrap();
        assert_eq!(decision.value()["throttle"], 0.0);
    }

    #[tokio::test]
    async fn stall_never_answers() {
        let mut plugin = Stall::new("car-0");
        let status = AgentStatus::default();
        let answered = tokio::time::timeout(
            Duration::from_millis(50),
            plugin.run_one_iteration(&status),
        )
        .await;
        assert!(answered.is_err());
    }

    #[tokio::test]
    async fn faulty_reports_tick() {
        let mut plugin = Faulty::new("car-0");
        let err = plugin
            .run_one_iteration(&AgentStatus::alive(7, serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "sensor fault at tick 7 (1 so far)");
    }
}
