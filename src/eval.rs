//! Action evaluator (C2): evaluates guard expressions and action statements
//! against a variable store, decoupling the engine from any particular
//! host-language backend (§4.2, Design Notes "Inheritance / duck-typing").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, EvalErrorKind};
use crate::ir::{CodeBlock, VarType};

/// A dynamically-typed engine variable (§3 `VariableStore`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::None => "none",
        }
    }

    pub fn matches_declared(&self, declared: VarType) -> bool {
        matches!(
            (declared, self),
            (VarType::Any, _)
                | (VarType::Int, Value::Int(_))
                | (VarType::Float, Value::Float(_))
                | (VarType::Bool, Value::Bool(_))
                | (VarType::String, Value::Str(_))
        )
    }

    fn from_rhai(dyn_value: rhai::Dynamic) -> Value {
        if dyn_value.is::<i64>() {
            Value::Int(dyn_value.cast::<i64>())
        } else if dyn_value.is::<f64>() {
            Value::Float(dyn_value.cast::<f64>())
        } else if dyn_value.is::<bool>() {
            Value::Bool(dyn_value.cast::<bool>())
        } else if dyn_value.is::<rhai::ImmutableString>() || dyn_value.is::<String>() {
            Value::Str(dyn_value.to_string())
        } else {
            Value::None
        }
    }

    fn to_rhai(&self) -> rhai::Dynamic {
        match self {
            Value::Int(i) => (*i).into(),
            Value::Float(f) => (*f).into(),
            Value::Bool(b) => (*b).into(),
            Value::Str(s) => s.clone().into(),
            Value::None => rhai::Dynamic::UNIT,
        }
    }
}

/// Owns the engine's current variable bindings (§3 `VariableStore`).
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: HashMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Capability interface for evaluating `CodeBlock`s. Backends are variants,
/// not subclasses — see Design Notes "Inheritance / duck-typing".
pub trait ActionEvaluator {
    fn eval_guard(&self, code: &CodeBlock, vars: &VariableStore) -> Result<bool, EvalError>;

    /// Executes an action, mutating `vars` in place, and returns log lines.
    fn exec_action(
        &self,
        code: &CodeBlock,
        vars: &mut VariableStore,
    ) -> Result<Vec<String>, EvalError>;
}

/// A sandboxed Rhai-backed evaluator — the "untrusted input" option named in
/// §4.2. Dispatches only on `CodeBlock.language == "rhai"`.
pub struct RhaiEvaluator {
    engine: rhai::Engine,
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        let mut engine = rhai::Engine::new();
        engine.set_max_expr_depths(32, 32);
        engine.set_max_operations(50_000);
        Self { engine }
    }
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_from(&self, vars: &VariableStore) -> rhai::Scope<'static> {
        let mut scope = rhai::Scope::new();
        for (name, value) in vars.iter() {
            scope.push_dynamic(name.clone(), value.to_rhai());
        }
        scope
    }

    fn classify(err: &rhai::EvalAltResult) -> EvalErrorKind {
        use rhai::EvalAltResult::*;
        match err {
            ErrorVariableNotFound(..) | ErrorPropertyNotFound(..) | ErrorFunctionNotFound(..) => {
                EvalErrorKind::NameError
            }
            ErrorMismatchDataType(..) | ErrorMismatchOutputType(..) => EvalErrorKind::TypeError,
            ErrorArithmetic(msg, _) if msg.to_lowercase().contains("divide") => {
                EvalErrorKind::DivideByZero
            }
            ErrorParsing(..) => EvalErrorKind::SyntaxError,
            _ => EvalErrorKind::Other,
        }
    }
}

impl ActionEvaluator for RhaiEvaluator {
    fn eval_guard(&self, code: &CodeBlock, vars: &VariableStore) -> Result<bool, EvalError> {
        let mut scope = self.scope_from(vars);
        self.engine
            .eval_with_scope::<bool>(&mut scope, &code.source)
            .map_err(|e| {
                EvalError::new(Self::classify(&e), code.source.clone()).at(e.to_string())
            })
    }

    fn exec_action(
        &self,
        code: &CodeBlock,
        vars: &mut VariableStore,
    ) -> Result<Vec<String>, EvalError> {
        let mut scope = self.scope_from(vars);
        let mut log_lines = Vec::new();

        self.engine
            .run_with_scope(&mut scope, &code.source)
            .map_err(|e| {
                EvalError::new(Self::classify(&e), code.source.clone()).at(e.to_string())
            })?;

        let known: Vec<String> = vars.iter().map(|(n, _)| n.clone()).collect();
        for name in known {
            if let Some(updated) = scope.get_value::<rhai::Dynamic>(&name) {
                let new_value = Value::from_rhai(updated);
                log_lines.push(format!("{name} -> {new_value:?}"));
                vars.set(name, new_value);
            }
        }
        // Variables introduced inside the action (new assignments on a
        // previously-unset name) are also captured.
        let introduced: Vec<String> = scope
            .iter()
            .map(|(n, _, _)| n.to_string())
            .filter(|n| vars.get(n).is_none())
            .collect();
        for name in introduced {
            if let Some(value) = scope.get_value::<rhai::Dynamic>(&name) {
                vars.set(name, Value::from_rhai(value));
            }
        }

        Ok(log_lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(src: &str) -> CodeBlock {
        CodeBlock::new("rhai", src)
    }

    #[test]
    fn guard_true_false() {
        let ev = RhaiEvaluator::new();
        let mut vars = VariableStore::new();
        vars.set("n", Value::Int(3));
        assert!(ev.eval_guard(&code("n >= 3"), &vars).unwrap());
        assert!(!ev.eval_guard(&code("n >= 4"), &vars).unwrap());
    }

    #[test]
    fn action_mutates_vars_and_logs() {
        let ev = RhaiEvaluator::new();
        let mut vars = VariableStore::new();
        vars.set("n", Value::Int(0));
        ev.exec_action(&code("n = n + 1;"), &mut vars).unwrap();
        assert_eq!(vars.get("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn syntax_error_is_classified() {
        let ev = RhaiEvaluator::new();
        let vars = VariableStore::new();
        let err = ev.eval_guard(&code("n >="), &vars).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::SyntaxError);
    }

    #[test]
    fn name_error_is_classified() {
        let ev = RhaiEvaluator::new();
        let vars = VariableStore::new();
        let err = ev.eval_guard(&code("undeclared_var > 0"), &vars).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::NameError);
    }
}
