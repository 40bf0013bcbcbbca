use lockstep::{AgentPlugin, AgentStatus, DebugState, Decision, PluginError};
use serde_json::json;

const DEFAULT_TARGET_SPEED: f64 = 12.0;
const GAIN: f64 = 0.25;

/// Proportional speed keeper.
///
/// Reads `speed` from the status state and answers with a throttle in `[-1, 1]`
/// that pulls it towards the target speed (`target_speed` in the initial state).
pub struct Cruise {
    name: String,
    target_speed: f64,
    debug: DebugState,
}

impl Cruise {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            target_speed: DEFAULT_TARGET_SPEED,
            debug: DebugState::new(),
        }
    }
}

#[async_trait::async_trait]
impl AgentPlugin for Cruise {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, status: &AgentStatus) -> Result<(), PluginError> {
        if let Some(target) = status.state.get("target_speed") {
            let target = target
                .as_f64()
                .filter(|t| t.is_finite() && *t >= 0.0)
                .ok_or_else(|| PluginError::new(format!("invalid target_speed {target}")))?;
            self.target_speed = target;
        }
        tracing::debug!(agent = %self.name, target_speed = self.target_speed, "Cruise initialized");
        Ok(())
    }

    async fn run_one_iteration(&mut self, status: &AgentStatus) -> Result<Decision, PluginError> {
        let speed = status
            .state
            .get("speed")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let error = self.target_speed - speed;
        let throttle = (GAIN * error).clamp(-1.0, 1.0);

        self.debug
            .insert("speed_error".to_string(), format!("{error:.3}"));
        Ok(Decision::new(json!({ "throttle": throttle, "steer": 0.0 })))
    }

    fn debug_state(&mut self) -> DebugState {
        std::mem::take(&mut self.debug)
    }
}
