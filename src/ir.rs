//! IR model (C1): a validated, language-neutral description of a hierarchical
//! state machine. Pure data plus one operation, [`validate`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::impl_from_primitive;

/// A non-empty, identifier-like variable or state name.
pub type Name = String;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarType {
    Int,
    Float,
    Bool,
    String,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: Name,
    pub var_type: VarType,
    pub initial: Option<serde_json::Value>,
}

/// An action-language snippet. `language` is opaque to the core and dispatched
/// on by the evaluator backend (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub source: String,
}

impl CodeBlock {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub name: Name,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_final: bool,
    pub entry_action: Option<CodeBlock>,
    pub during_action: Option<CodeBlock>,
    pub exit_action: Option<CodeBlock>,
    pub sub_machine: Option<Box<FsmModel>>,
    #[serde(default)]
    pub breakpoint_on_entry: bool,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn with_entry(mut self, code: CodeBlock) -> Self {
        self.entry_action = Some(code);
        self
    }

    pub fn with_during(mut self, code: CodeBlock) -> Self {
        self.during_action = Some(code);
        self
    }

    pub fn with_exit(mut self, code: CodeBlock) -> Self {
        self.exit_action = Some(code);
        self
    }

    pub fn with_sub_machine(mut self, sub: FsmModel) -> Self {
        self.sub_machine = Some(Box::new(sub));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub source_name: Name,
    pub target_name: Name,
    pub event: Option<String>,
    pub condition: Option<CodeBlock>,
    pub action: Option<CodeBlock>,
    #[serde(default)]
    pub breakpoint_on_fire: bool,
}

impl Transition {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_name: source.into(),
            target_name: target.into(),
            event: None,
            condition: None,
            action: None,
            breakpoint_on_fire: false,
        }
    }

    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn guarded_by(mut self, cond: CodeBlock) -> Self {
        self.condition = Some(cond);
        self
    }

    pub fn with_action(mut self, action: CodeBlock) -> Self {
        self.action = Some(action);
        self
    }
}

/// An immutable, validated FSM: states, ordered transitions, the initial
/// state, and optionally declared variables (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsmModel {
    pub states: HashMap<Name, State>,
    pub transitions: Vec<Transition>,
    pub initial_state_name: Name,
    #[serde(default)]
    pub variables_declared: Vec<VariableDecl>,
}

impl FsmModel {
    pub fn builder() -> FsmModelBuilder {
        FsmModelBuilder::default()
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// Transitions whose `source_name` is `name`, in IR order.
    pub fn outgoing<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Transition> {
        self.transitions.iter().filter(move |t| t.source_name == name)
    }
}

#[derive(Default)]
pub struct FsmModelBuilder {
    states: Vec<State>,
    transitions: Vec<Transition>,
    initial_state_name: Name,
    variables_declared: Vec<VariableDecl>,
}

impl FsmModelBuilder {
    pub fn state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial_state_name = name.into();
        self
    }

    pub fn variable(mut self, decl: VariableDecl) -> Self {
        self.variables_declared.push(decl);
        self
    }

    pub fn build(self) -> FsmModel {
        let initial_state_name = if self.initial_state_name.is_empty() {
            self.states
                .iter()
                .find(|s| s.is_initial)
                .map(|s| s.name.clone())
                .unwrap_or_default()
        } else {
            self.initial_state_name
        };

        FsmModel {
            states: self
                .states
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            transitions: self.transitions,
            initial_state_name,
            variables_declared: self.variables_declared,
        }
    }
}

/// A wrapped diagnostic path, e.g. `"Root/Superstate/SubMachine"`, used so
/// diagnostics from recursively-validated sub-machines can be traced back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticPath(pub String);
impl_from_primitive!(DiagnosticPath, String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    DuplicateStateName { path: DiagnosticPath, name: Name },
    NoInitialState { path: DiagnosticPath },
    MultipleInitialStates { path: DiagnosticPath, names: Vec<Name> },
    DanglingTransitionEndpoint {
        path: DiagnosticPath,
        transition_index: usize,
        endpoint: Name,
    },
    EmptyIdentifier { path: DiagnosticPath, what: &'static str },
    CyclicSubMachine { path: DiagnosticPath, state: Name },
    UnknownActionLanguage { path: DiagnosticPath, language: String },
}

/// Validates `model` and every `sub_machine` transitively (§4.1). Collects
/// *all* diagnostics rather than short-circuiting on the first failure.
pub fn validate(model: &FsmModel) -> Result<(), Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let mut ancestry = HashSet::new();
    validate_recursive(model, &DiagnosticPath("root".into()), &mut ancestry, &mut diagnostics);

    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

const KNOWN_LANGUAGES: &[&str] = &["rhai"];

fn validate_recursive(
    model: &FsmModel,
    path: &DiagnosticPath,
    ancestry: &mut HashSet<*const FsmModel>,
    out: &mut Vec<Diagnostic>,
) {
    // Cycle guard: a sub-machine must never (transitively) contain itself.
    let ptr = model as *const FsmModel;
    if !ancestry.insert(ptr) {
        out.push(Diagnostic::CyclicSubMachine {
            path: path.clone(),
            state: model.initial_state_name.clone(),
        });
        return;
    }

    if model.initial_state_name.is_empty() {
        out.push(Diagnostic::EmptyIdentifier {
            path: path.clone(),
            what: "initial_state_name",
        });
    }

    let initial_siblings: Vec<_> = model
        .states
        .values()
        .filter(|s| s.is_initial)
        .map(|s| s.name.clone())
        .collect();
    match initial_siblings.len() {
        0 => out.push(Diagnostic::NoInitialState { path: path.clone() }),
        1 => {}
        _ => out.push(Diagnostic::MultipleInitialStates {
            path: path.clone(),
            names: initial_siblings,
        }),
    }

    for state in model.states.values() {
        if state.name.is_empty() {
            out.push(Diagnostic::EmptyIdentifier {
                path: path.clone(),
                what: "state name",
            });
        }
        check_language(&state.entry_action, path, out);
        check_language(&state.during_action, path, out);
        check_language(&state.exit_action, path, out);

        if let Some(sub) = &state.sub_machine {
            let sub_path = DiagnosticPath(format!("{}/{}", path.0, state.name));
            validate_recursive(sub, &sub_path, ancestry, out);
        }
    }

    // Duplicate names: HashMap already dedupes by key, so instead detect the
    // case where the declared `name` field disagrees with the map key (the
    // parser is responsible for keying by `name`, but a hand-built model may
    // not honor that).
    let mut seen = HashSet::new();
    for (key, state) in &model.states {
        if state.name != *key || !seen.insert(state.name.clone()) {
            out.push(Diagnostic::DuplicateStateName {
                path: path.clone(),
                name: state.name.clone(),
            });
        }
    }

    for (index, transition) in model.transitions.iter().enumerate() {
        if !model.states.contains_key(&transition.source_name) {
            out.push(Diagnostic::DanglingTransitionEndpoint {
                path: path.clone(),
                transition_index: index,
                endpoint: transition.source_name.clone(),
            });
        }
        if !model.states.contains_key(&transition.target_name) {
            out.push(Diagnostic::DanglingTransitionEndpoint {
                path: path.clone(),
                transition_index: index,
                endpoint: transition.target_name.clone(),
            });
        }
        check_language(&transition.condition, path, out);
        check_language(&transition.action, path, out);
    }

    ancestry.remove(&ptr);
}

fn check_language(block: &Option<CodeBlock>, path: &DiagnosticPath, out: &mut Vec<Diagnostic>) {
    if let Some(block) = block {
        if !KNOWN_LANGUAGES.contains(&block.language.as_str()) {
            out.push(Diagnostic::UnknownActionLanguage {
                path: path.clone(),
                language: block.language.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn valid_model_has_no_diagnostics() {
        assert!(validate(&toggle_model()).is_ok());
    }

    #[test]
    fn dangling_endpoint_is_reported() {
        let mut model = toggle_model();
        model.transitions.push(Transition::new("On", "Nowhere"));
        let diagnostics = validate(&model).unwrap_err();
        assert!(diagnostics.iter().any(|d| matches!(
            d,
            Diagnostic::DanglingTransitionEndpoint { endpoint, .. } if endpoint == "Nowhere"
        )));
    }

    #[test]
    fn validation_is_total_not_short_circuiting() {
        let mut model = toggle_model();
        model.transitions.push(Transition::new("Ghost1", "On"));
        model.transitions.push(Transition::new("Ghost2", "On"));
        let diagnostics = validate(&model).unwrap_err();
        let dangling_count = diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::DanglingTransitionEndpoint { .. }))
            .count();
        assert_eq!(dangling_count, 2);
    }

    #[test]
    fn multiple_initial_states_at_same_level_is_reported() {
        let model = FsmModel::builder()
            .state(State::new("A").initial())
            .state(State::new("B").initial())
            .transition(Transition::new("A", "B"))
            .initial("A")
            .build();
        let diagnostics = validate(&model).unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::MultipleInitialStates { .. })));
    }

    #[test]
    fn recurses_into_sub_machines() {
        let sub = FsmModel::builder()
            .state(State::new("Sub1").initial())
            .initial("Sub1")
            .build();
        let mut bad_sub = sub.clone();
        bad_sub.transitions.push(Transition::new("Sub1", "Missing"));

        let model = FsmModel::builder()
            .state(State::new("A").initial().with_sub_machine(bad_sub))
            .initial("A")
            .build();

        let diagnostics = validate(&model).unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::DanglingTransitionEndpoint { .. })));
    }
}
