//! Event bus (C4): ordered, lossless delivery of engine events to subscribers
//! (§4.4, §5). Implemented as the engine-thread synchronous callback registry
//! the spec names as a valid option — this trivially guarantees per-subscriber
//! FIFO ordering and back-pressure-by-construction (`notify` is a direct call,
//! so a slow subscriber simply makes `step` take longer; nothing is dropped).

use std::collections::HashMap;

use crate::eval::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    StopTickReached,
    ActionError(String),
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    TickProcessed {
        tick: u64,
        vars: HashMap<String, Value>,
    },
    TransitionTaken {
        source: String,
        target: String,
        event: Option<String>,
    },
    LogLines(Vec<String>),
    EngineHalted {
        reason: HaltReason,
    },
    /// Emitted by the hardware link (§4.6).
    HardwareEvent(String),
    HardwareData(String, f64),
    /// A line from the serial link that didn't parse as `EVT:`/`DATA:`,
    /// forwarded raw for monitoring rather than dropped.
    HardwareRaw(String),
    LinkLost,
    /// Emitted by the co-sim link (§4.7).
    CommandCompleted {
        success: bool,
        message: String,
        data: Option<serde_json::Value>,
        kind: String,
        metadata: HashMap<String, String>,
    },
    CommandFailed {
        reason: String,
        kind: String,
    },
    CoSimLiveUpdate(String),
}

/// A subscriber is any closure (or object) that can receive events in order.
pub trait Subscriber: Send {
    fn on_event(&mut self, event: &EngineEvent);
}

impl<F: FnMut(&EngineEvent) + Send> Subscriber for F {
    fn on_event(&mut self, event: &EngineEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Subscriber + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Delivers `event` to every subscriber, in subscription order. Because
    /// delivery is a direct synchronous call, a subscriber is guaranteed to
    /// see event N before event N+1 (§5 ordering guarantees).
    pub fn publish(&mut self, event: EngineEvent) {
        for subscriber in &mut self.subscribers {
            subscriber.on_event(&event);
        }
    }
}
