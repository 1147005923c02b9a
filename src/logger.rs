//! Data logger (C5): captures per-tick numeric/boolean variable history for
//! plotting and analysis by subscribing to [`EngineEvent::TickProcessed`].

use std::collections::HashMap;

use tracing::info;

use crate::bus::{EngineEvent, Subscriber};
use crate::eval::Value;

/// One `(tick, value)` sample. Tick values are strictly non-decreasing and
/// unique per variable, since they mirror the engine's own tick counter.
pub type Sample = (u64, f64);

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Str(_) | Value::None => None,
    }
}

/// Captures and stores FSM simulation history for plotting and analysis.
#[derive(Debug, Default)]
pub struct SimulationDataLogger {
    series: HashMap<String, Vec<Sample>>,
    is_logging: bool,
}

impl SimulationDataLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears previous data and starts a new logging session.
    pub fn start(&mut self) {
        self.series.clear();
        self.is_logging = true;
        info!("data logger: started new logging session");
    }

    pub fn stop(&mut self) {
        self.is_logging = false;
        info!("data logger: stopped logging session");
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }

    pub fn is_logging(&self) -> bool {
        self.is_logging
    }

    pub fn series(&self, name: &str) -> &[Sample] {
        self.series.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    fn record(&mut self, tick: u64, vars: &HashMap<String, Value>) {
        if !self.is_logging {
            return;
        }
        for (name, value) in vars {
            if let Some(v) = numeric(value) {
                self.series.entry(name.clone()).or_default().push((tick, v));
            }
        }
    }
}

impl Subscriber for SimulationDataLogger {
    fn on_event(&mut self, event: &EngineEvent) {
        if let EngineEvent::TickProcessed { tick, vars } = event {
            self.record(*tick, vars);
        }
    }
}
