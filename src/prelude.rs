// 1. Traits
pub use crate::bus::Subscriber;
pub use crate::cosim::CommandExecutor;
pub use crate::eval::ActionEvaluator;
pub use crate::hardware::{SerialTransport, SerialTransportFactory};

// 2. The Core "Loop" Types
pub use crate::engine::{EngineConfig, SimulationEngine, SimulationState};
pub use crate::eval::{RhaiEvaluator, Value, VariableStore};

// 3. IR / Model Types
pub use crate::ir::{
    CodeBlock, Diagnostic, DiagnosticPath, FsmModel, FsmModelBuilder, Name, State, Transition,
    VarType, VariableDecl,
};

// 4. Events
pub use crate::bus::{EngineEvent, EventBus, HaltReason};

// 5. Errors
pub use crate::error::{ActionError, EngineError, EngineResult, EvalError, EvalErrorKind, LinkError};

// 6. Adapters & Configs
pub use crate::config::{CoSimLinkConfig, HardwareLinkConfig};
pub use crate::cosim::{CoSimCommand, CoSimLink, CommandKind, CommandOutcome, Priority};
pub use crate::hardware::HardwareLink;
pub use crate::logger::SimulationDataLogger;
