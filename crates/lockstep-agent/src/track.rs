//! A one-dimensional track: the minimal world the `lockstep` binary drives.
//!
//! Cars accelerate according to their agent's `throttle`. A car whose agent is missing
//! from the response table for `patience` consecutive iterations is eliminated.

use std::collections::{BTreeMap, HashMap};

use lockstep::{AgentStatus, ResponseTable};
use serde_json::{Value, json};

/// m/s² at full throttle.
const ACCELERATION: f64 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Car {
    pub position: f64,
    pub speed: f64,
    pub target_speed: f64,
    pub alive: bool,
    missed: u32,
}

pub struct Track {
    cars: BTreeMap<String, Car>,
    dt: f64,
    patience: u32,
    tick: u64,
}

impl Track {
    /// `dt` is simulated seconds per iteration.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, dt: f64, patience: u32) -> Self {
        let cars = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let car = Car {
                    position: 0.0,
                    speed: 0.0,
                    target_speed: 10.0 + 2.0 * i as f64,
                    alive: true,
                    missed: 0,
                };
                (name.to_string(), car)
            })
            .collect();
        Self {
            cars,
            dt,
            patience: patience.max(1),
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn car(&self, name: &str) -> Option<&Car> {
        self.cars.get(name)
    }

    pub fn alive_count(&self) -> usize {
        self.cars.values().filter(|c| c.alive).count()
    }

    pub fn statuses(&self) -> HashMap<String, AgentStatus> {
        self.cars
            .iter()
            .map(|(name, car)| {
                let status = if car.alive {
                    AgentStatus::alive(
                        self.tick,
                        json!({
                            "position": car.position,
                            "speed": car.speed,
                            "target_speed": car.target_speed,
                        }),
                    )
                } else {
                    AgentStatus::eliminated(self.tick)
                };
                (name.clone(), status)
            })
            .collect()
    }

    /// Advance one iteration using the agents' answers.
    pub fn apply(&mut self, table: &ResponseTable) {
        self.tick += 1;
        for (name, car) in self.cars.iter_mut().filter(|(_, c)| c.alive) {
            let Some(response) = table.get(name) else {
                car.missed += 1;
                if car.missed >= self.patience {
                    car.alive = false;
                    tracing::info!(agent = %name, tick = self.tick, "Car eliminated after missed iterations");
                }
                continue;
            };
            car.missed = 0;

            let throttle = response
                .decision
                .value()
                .get("throttle")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .clamp(-1.0, 1.0);
            car.speed = (car.speed + throttle * ACCELERATION * self.dt).max(0.0);
            car.position += car.speed * self.dt;
        }
    }

    pub fn snapshot(&self) -> Value {
        let cars: serde_json::Map<String, Value> = self
            .cars
            .iter()
            .map(|(name, car)| {
                (
                    name.clone(),
                    json!({
                        "position": car.position,
                        "speed": car.speed,
                        "alive": car.alive,
                    }),
                )
            })
            .collect();
        json!({ "tick": self.tick, "cars": cars })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep::{AgentResponse, Decision};

    fn answer(throttle: f64) -> AgentResponse {
        AgentResponse {
            decision: Decision::new(json!({ "throttle": throttle })),
            elapsed: 0.0,
            debug: Default::default(),
        }
    }

    #[test]
    fn throttle_moves_car() {
        let mut track = Track::new(["car-0"], 0.5, 3);
        let table = ResponseTable::from([("car-0".to_string(), answer(1.0))]);

        track.apply(&table);
        let car = track.car("car-0").unwrap();
        assert_eq!(car.speed, 2.0);
        assert_eq!(car.position, 1.0);
        assert_eq!(track.tick(), 1);
    }

    #[test]
    fn silent_car_is_eliminated_after_patience() {
        let mut track = Track::new(["car-0", "car-1"], 0.1, 2);
        let table = ResponseTable::from([("car-0".to_string(), answer(0.5))]);

        track.apply(&table);
        assert_eq!(track.alive_count(), 2);
        track.apply(&table);
        assert_eq!(track.alive_count(), 1);
        assert!(!track.statuses()["car-1"].alive);
        assert!(track.statuses()["car-0"].alive);
    }

    #[test]
    fn snapshot_lists_cars() {
        let track = Track::new(["car-0"], 0.1, 1);
        let snapshot = track.snapshot();
        assert_eq!(snapshot["tick"], 0);
        assert_eq!(snapshot["cars"]["car-0"]["alive"], true);
    }
}
