//! Simulation engine (C3): a single-threaded, tick-driven hierarchical FSM
//! interpreter over an [`FsmModel`] and an [`ActionEvaluator`] (§4.3).

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use crate::bus::{EngineEvent, EventBus, HaltReason};
use crate::error::{ActionError, EngineError, EngineResult};
use crate::eval::{ActionEvaluator, Value, VariableStore};
use crate::ir::{validate, CodeBlock, FsmModel, Name, VarType};

/// Ambient configuration for a [`SimulationEngine`] (SPEC_FULL §A.3).
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub halt_on_action_error: bool,
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            halt_on_action_error: false,
            event_queue_capacity: 256,
        }
    }
}

/// Engine-owned mutable execution state (§3 `SimulationState`).
#[derive(Debug, Clone)]
pub struct SimulationState {
    pub current_state_path: Vec<Name>,
    pub tick: u64,
    pub halted: bool,
    pub paused_on_breakpoint: bool,
    pub stop_tick: Option<u64>,
    pending_events: VecDeque<String>,
    pub last_tick_log: Vec<String>,
}

pub struct SimulationEngine {
    model: FsmModel,
    vars: VariableStore,
    declared_types: HashMap<Name, VarType>,
    state: SimulationState,
    evaluator: Box<dyn ActionEvaluator + Send>,
    bus: EventBus,
    config: EngineConfig,
}

fn initial_path(model: &FsmModel) -> Vec<Name> {
    let mut path = vec![model.initial_state_name.clone()];
    if let Some(state) = model.state(&model.initial_state_name) {
        if let Some(sub) = &state.sub_machine {
            path.extend(initial_path(sub));
        }
    }
    path
}

/// Walks `path` from `root`, returning, for each index, the [`FsmModel`] that
/// directly owns `path[i]` (i.e. declares it in its `states` map).
fn model_chain<'a>(root: &'a FsmModel, path: &[Name]) -> Vec<&'a FsmModel> {
    let mut chain = Vec::with_capacity(path.len());
    let mut current = root;
    for name in path {
        chain.push(current);
        if let Some(state) = current.state(name) {
            if let Some(sub) = &state.sub_machine {
                current = sub;
            }
        }
    }
    chain
}

fn parse_initial_value(var_type: VarType, raw: &serde_json::Value) -> Value {
    match var_type {
        VarType::Int => raw.as_i64().map(Value::Int).unwrap_or(Value::None),
        VarType::Float => raw.as_f64().map(Value::Float).unwrap_or(Value::None),
        VarType::Bool => raw.as_bool().map(Value::Bool).unwrap_or(Value::None),
        VarType::String => raw.as_str().map(|s| Value::Str(s.to_string())).unwrap_or(Value::None),
        VarType::Any => Value::None,
    }
}

impl SimulationEngine {
    #[tracing::instrument(skip(model, evaluator, initial_vars), fields(initial_state = %model.initial_state_name))]
    pub fn new(
        model: FsmModel,
        initial_vars: HashMap<String, Value>,
        evaluator: Box<dyn ActionEvaluator + Send>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        validate(&model).map_err(EngineError::ModelInvalid)?;

        let mut declared_types = HashMap::new();
        let mut vars = VariableStore::new();
        for decl in &model.variables_declared {
            declared_types.insert(decl.name.clone(), decl.var_type);
            let default_value = decl
                .initial
                .as_ref()
                .map(|raw| parse_initial_value(decl.var_type, raw))
                .unwrap_or(Value::None);
            vars.set(decl.name.clone(), default_value);
        }

        for (name, value) in initial_vars {
            if let Some(expected) = declared_types.get(&name) {
                if !value.matches_declared(*expected) {
                    return Err(EngineError::VarTypeMismatch {
                        name,
                        expected: expected.to_string(),
                    });
                }
            }
            vars.set(name, value);
        }

        let current_state_path = initial_path(&model);
        info!(path = ?current_state_path, "engine initialized");

        Ok(Self {
            model,
            vars,
            declared_types,
            state: SimulationState {
                current_state_path,
                tick: 0,
                halted: false,
                paused_on_breakpoint: false,
                stop_tick: None,
                pending_events: VecDeque::new(),
                last_tick_log: Vec::new(),
            },
            evaluator,
            bus: EventBus::new(),
            config,
        })
    }

    pub fn subscribe(&mut self, subscriber: impl crate::bus::Subscriber + 'static) {
        self.bus.subscribe(subscriber);
    }

    pub fn set_stop_tick(&mut self, n: u64) {
        self.state.stop_tick = Some(n);
    }

    pub fn inject_event(&mut self, name: impl Into<String>) -> EngineResult<()> {
        if self.state.pending_events.len() >= self.config.event_queue_capacity {
            return Err(EngineError::QueueFull {
                capacity: self.config.event_queue_capacity,
            });
        }
        self.state.pending_events.push_back(name.into());
        Ok(())
    }

    pub fn continue_from_breakpoint(&mut self) -> bool {
        if self.state.paused_on_breakpoint {
            self.state.paused_on_breakpoint = false;
            true
        } else {
            false
        }
    }

    /// Returns the engine to `tick = 0` with variables re-initialized to the
    /// model's declared defaults (not the construction-time overrides — see
    /// DESIGN.md "reset semantics").
    pub fn reset(&mut self) {
        self.vars = VariableStore::new();
        for decl in &self.model.variables_declared {
            let default_value = decl
                .initial
                .as_ref()
                .map(|raw| parse_initial_value(decl.var_type, raw))
                .unwrap_or(Value::None);
            self.vars.set(decl.name.clone(), default_value);
        }
        self.state.current_state_path = initial_path(&self.model);
        self.state.tick = 0;
        self.state.halted = false;
        self.state.paused_on_breakpoint = false;
        self.state.pending_events.clear();
        self.state.last_tick_log.clear();
    }

    pub fn get_variables(&self) -> HashMap<String, Value> {
        self.vars.snapshot()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) -> EngineResult<()> {
        let name = name.into();
        if let Some(expected) = self.declared_types.get(&name) {
            if !value.matches_declared(*expected) {
                return Err(EngineError::VarTypeMismatch {
                    name,
                    expected: expected.to_string(),
                });
            }
        }
        self.vars.set(name, value);
        Ok(())
    }

    /// The hierarchical leaf name, rendered as a `/`-joined path (e.g. `A/A1`).
    pub fn get_current_state_name(&self) -> String {
        self.state.current_state_path.join("/")
    }

    pub fn get_possible_events_from_current(&self) -> HashSet<String> {
        let chain = model_chain(&self.model, &self.state.current_state_path);
        let mut events = HashSet::new();
        for (model, name) in chain.iter().zip(&self.state.current_state_path) {
            for transition in model.outgoing(name) {
                if let Some(event) = &transition.event {
                    events.insert(event.clone());
                }
            }
        }
        events
    }

    pub fn last_tick_log(&self) -> &[String] {
        &self.state.last_tick_log
    }

    pub fn status(&self) -> &SimulationState {
        &self.state
    }

    /// Runs `step(None)` until the engine halts or `max_ticks` internal steps
    /// have elapsed (SPEC_FULL §B, a host-side convenience loop; no new
    /// engine semantics).
    pub fn run_until_halted_or(&mut self, max_ticks: u64) -> EngineResult<()> {
        for _ in 0..max_ticks {
            if self.state.halted || self.state.paused_on_breakpoint {
                break;
            }
            self.step(None)?;
        }
        Ok(())
    }

    /// Executes exactly one tick (§4.3 "Tick algorithm").
    #[tracing::instrument(skip(self, external_event), fields(tick = self.state.tick))]
    pub fn step(&mut self, external_event: Option<String>) -> EngineResult<(String, Vec<String>)> {
        if self.state.halted || self.state.paused_on_breakpoint {
            return Ok((self.get_current_state_name(), Vec::new()));
        }

        let considered_event = external_event.or_else(|| self.state.pending_events.pop_front());
        let mut log: Vec<String> = Vec::new();

        let fired = self.find_eligible_transition(considered_event.as_deref(), &mut log);

        let mut transition_taken = None;
        if let Some((level, transition)) = fired {
            let source_leaf = self.get_current_state_name();
            if let Err(action_err) = self.apply_transition(level, &transition, &mut log) {
                return self.fatal_halt(action_err, log);
            }
            let target_leaf = self.get_current_state_name();
            transition_taken = Some((source_leaf, target_leaf, transition.event.clone()));

            let leaf_chain = model_chain(&self.model, &self.state.current_state_path);
            let leaf_name = self.state.current_state_path.last().unwrap();
            let breakpoint = transition.breakpoint_on_fire
                || leaf_chain
                    .last()
                    .and_then(|m| m.state(leaf_name))
                    .map(|s| s.breakpoint_on_entry)
                    .unwrap_or(false);
            if breakpoint {
                self.state.paused_on_breakpoint = true;
                debug!("paused on breakpoint");
            }
        }

        if let Err(action_err) = self.run_during_actions(&mut log) {
            return self.fatal_halt(action_err, log);
        }

        self.state.tick += 1;
        if let Some(stop_tick) = self.state.stop_tick {
            if self.state.tick >= stop_tick {
                self.state.halted = true;
            }
        }

        if let Some((source, target, event)) = transition_taken {
            self.bus.publish(EngineEvent::TransitionTaken {
                source,
                target,
                event,
            });
        }
        self.bus.publish(EngineEvent::TickProcessed {
            tick: self.state.tick,
            vars: self.vars.snapshot(),
        });
        self.bus.publish(EngineEvent::LogLines(log.clone()));
        if self.state.halted {
            self.bus.publish(EngineEvent::EngineHalted {
                reason: HaltReason::StopTickReached,
            });
        }

        self.state.last_tick_log = log.clone();
        Ok((self.get_current_state_name(), log))
    }

    fn fatal_halt(
        &mut self,
        action_err: ActionError,
        log: Vec<String>,
    ) -> EngineResult<(String, Vec<String>)> {
        self.state.halted = true;
        self.bus.publish(EngineEvent::LogLines(log.clone()));
        self.bus.publish(EngineEvent::EngineHalted {
            reason: HaltReason::ActionError(action_err.to_string()),
        });
        self.state.last_tick_log = log;
        Err(EngineError::Action(action_err))
    }

    /// Runs `code`, honoring `halt_on_action_error`. Non-fatal failures are
    /// logged and swallowed (§4.3 Failure semantics); fatal ones are returned
    /// for the caller to escalate and halt on.
    fn run_action(&mut self, code: &CodeBlock, log: &mut Vec<String>) -> Result<(), ActionError> {
        match self.evaluator.exec_action(code, &mut self.vars) {
            Ok(lines) => {
                log.extend(lines);
                Ok(())
            }
            Err(e) => {
                log.push(format!("ERROR: action failed: {e}"));
                if self.config.halt_on_action_error {
                    Err(ActionError(e))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn find_eligible_transition(
        &mut self,
        considered_event: Option<&str>,
        log: &mut Vec<String>,
    ) -> Option<(usize, crate::ir::Transition)> {
        let chain = model_chain(&self.model, &self.state.current_state_path);
        for level in (0..chain.len()).rev() {
            let model = chain[level];
            let name = &self.state.current_state_path[level];
            for transition in model.outgoing(name) {
                let event_matches =
                    transition.event.is_none() || transition.event.as_deref() == considered_event;
                if !event_matches {
                    continue;
                }
                let guard_ok = match &transition.condition {
                    None => true,
                    Some(cond) => match self.evaluator.eval_guard(cond, &self.vars) {
                        Ok(value) => value,
                        Err(e) => {
                            log.push(format!("WARN: guard error, transition skipped: {e}"));
                            false
                        }
                    },
                };
                if guard_ok {
                    return Some((level, transition.clone()));
                }
            }
        }
        None
    }

    fn apply_transition(
        &mut self,
        level: usize,
        transition: &crate::ir::Transition,
        log: &mut Vec<String>,
    ) -> Result<(), ActionError> {
        let old_path = self.state.current_state_path.clone();

        // Plan phase: borrows `self.model` only, nothing is mutated yet.
        let exit_list: Vec<(Name, Option<CodeBlock>)> = {
            let old_chain = model_chain(&self.model, &old_path);
            (level..old_path.len())
                .rev()
                .map(|idx| {
                    let exit = old_chain[idx]
                        .state(&old_path[idx])
                        .and_then(|s| s.exit_action.clone());
                    (old_path[idx].clone(), exit)
                })
                .collect()
        };

        let new_path = {
            let old_chain = model_chain(&self.model, &old_path);
            let target_model = old_chain[level];
            let mut path = old_path[..level].to_vec();
            path.push(transition.target_name.clone());
            if let Some(target_state) = target_model.state(&transition.target_name) {
                if let Some(sub) = &target_state.sub_machine {
                    path.extend(initial_path(sub));
                }
            }
            path
        };

        let entry_list: Vec<(Name, Option<CodeBlock>)> = {
            let new_chain = model_chain(&self.model, &new_path);
            (level..new_path.len())
                .map(|idx| {
                    let entry = new_chain[idx]
                        .state(&new_path[idx])
                        .and_then(|s| s.entry_action.clone());
                    (new_path[idx].clone(), entry)
                })
                .collect()
        };

        // Execute phase: no outstanding borrow of `self.model` remains.
        for (name, exit) in exit_list {
            if let Some(exit) = exit {
                log.push(format!("exit({name})"));
                self.run_action(&exit, log)?;
            }
        }

        if let Some(action) = transition.action.clone() {
            log.push(format!(
                "action({} -> {})",
                transition.source_name, transition.target_name
            ));
            self.run_action(&action, log)?;
        }

        for (name, entry) in entry_list {
            if let Some(entry) = entry {
                log.push(format!("entry({name})"));
                self.run_action(&entry, log)?;
            }
        }

        self.state.current_state_path = new_path;
        Ok(())
    }

    fn run_during_actions(&mut self, log: &mut Vec<String>) -> Result<(), ActionError> {
        let during_list: Vec<Option<CodeBlock>> = {
            let chain = model_chain(&self.model, &self.state.current_state_path);
            chain
                .iter()
                .zip(&self.state.current_state_path)
                .map(|(model, name)| model.state(name).and_then(|s| s.during_action.clone()))
                .collect()
        };
        for during in during_list.into_iter().flatten() {
            self.run_action(&during, log)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::RhaiEvaluator;
    use crate::ir::{FsmModel, State, Transition, VarType, VariableDecl};

    fn engine(model: FsmModel) -> SimulationEngine {
        SimulationEngine::new(
            model,
            HashMap::new(),
            Box::new(RhaiEvaluator::new()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn toggle_model() -> FsmModel {
        FsmModel::builder()
            .state(State::new("Off").initial())
            .state(State::new("On"))
            .transition(Transition::new("Off", "On").on_event("toggle"))
            .transition(Transition::new("On", "Off").on_event("toggle"))
            .initial("Off")
            .build()
    }

    #[test]
    fn scenario_1_toggle_fsm() {
        let mut e = engine(toggle_model());
        e.inject_event("toggle").unwrap();
        let (leaf, _) = e.step(None).unwrap();
        assert_eq!(leaf, "On");
        e.inject_event("toggle").unwrap();
        let (leaf, _) = e.step(None).unwrap();
        assert_eq!(leaf, "Off");
    }

    #[test]
    fn scenario_2_guarded_counter() {
        let model = FsmModel::builder()
            .variable(VariableDecl {
                name: "n".into(),
                var_type: VarType::Int,
                initial: Some(serde_json::json!(0)),
            })
            .state(State::new("S").initial())
            .state(State::new("E"))
            .transition(Transition::new("S", "E").on_event("done").guarded_by(
                CodeBlock::new("rhai", "n >= 3"),
            ))
            .transition(
                Transition::new("S", "S").with_action(CodeBlock::new("rhai", "n = n + 1;")),
            )
            .initial("S")
            .build();
        let mut e = engine(model);

        for expected_n in 1..=3 {
            let (leaf, _) = e.step(None).unwrap();
            assert_eq!(leaf, "S");
            assert_eq!(e.get_variables().get("n"), Some(&Value::Int(expected_n)));
        }

        e.inject_event("done").unwrap();
        let (leaf, _) = e.step(None).unwrap();
        assert_eq!(leaf, "E");
    }

    #[test]
    fn scenario_3_hierarchical_exit_order() {
        let sub = FsmModel::builder()
            .state(State::new("A1").initial().with_exit(CodeBlock::new("rhai", "let log_a1 = 1;")))
            .initial("A1")
            .build();
        let model = FsmModel::builder()
            .state(
                State::new("A")
                    .initial()
                    .with_exit(CodeBlock::new("rhai", "let log_a = 1;"))
                    .with_sub_machine(sub),
            )
            .state(State::new("B").with_entry(CodeBlock::new("rhai", "let log_b = 1;")))
            .transition(Transition::new("A", "B").on_event("escape"))
            .initial("A")
            .build();
        let mut e = engine(model);
        e.inject_event("escape").unwrap();
        let (leaf, log) = e.step(None).unwrap();
        assert_eq!(leaf, "B");
        let exit_a1 = log.iter().position(|l| l == "exit(A1)").unwrap();
        let exit_a = log.iter().position(|l| l == "exit(A)").unwrap();
        let entry_b = log.iter().position(|l| l == "entry(B)").unwrap();
        assert!(exit_a1 < exit_a);
        assert!(exit_a < entry_b);
    }

    #[test]
    fn scenario_4_action_error_halts() {
        let model = FsmModel::builder()
            .state(State::new("S").initial())
            .state(State::new("T"))
            .transition(
                Transition::new("S", "T").with_action(CodeBlock::new("rhai", "this is not valid rhai {")),
            )
            .initial("S")
            .build();
        let mut e = SimulationEngine::new(
            model,
            HashMap::new(),
            Box::new(RhaiEvaluator::new()),
            EngineConfig {
                halt_on_action_error: true,
                ..Default::default()
            },
        )
        .unwrap();

        let first = e.step(None);
        assert!(first.is_err());
        assert!(e.status().halted);

        let (leaf, log) = e.step(None).unwrap();
        assert_eq!(leaf, "S");
        assert!(log.is_empty());
    }

    #[test]
    fn stop_tick_halts_exactly_when_reached() {
        let mut e = engine(toggle_model());
        e.set_stop_tick(3);
        for _ in 0..2 {
            e.step(None).unwrap();
            assert!(!e.status().halted);
        }
        e.step(None).unwrap();
        assert!(e.status().halted);
    }

    #[test]
    fn queue_full_without_losing_earlier_events() {
        let mut e = SimulationEngine::new(
            toggle_model(),
            HashMap::new(),
            Box::new(RhaiEvaluator::new()),
            EngineConfig {
                event_queue_capacity: 1,
                ..Default::default()
            },
        )
        .unwrap();
        e.inject_event("toggle").unwrap();
        assert!(matches!(
            e.inject_event("toggle"),
            Err(EngineError::QueueFull { capacity: 1 })
        ));
        let (leaf, _) = e.step(None).unwrap();
        assert_eq!(leaf, "On");
    }

    #[test]
    fn reset_is_idempotent() {
        let mut e = engine(toggle_model());
        e.inject_event("toggle").unwrap();
        e.step(None).unwrap();
        e.reset();
        let first = e.get_current_state_name();
        e.reset();
        assert_eq!(e.get_current_state_name(), first);
        assert_eq!(e.status().tick, 0);
    }
}
