//! Procedure files.
//!
//! ```toml
//! [procedure]
//! type = "curve"
//! name = "Transfer curve, 10 uA"
//!
//! [params]
//! variant = "transfer_by_current"
//! drain_currents = [10e-6]
//! gate_stop = 60.0
//! sample = "TBG-07"
//!
//! # Optional: one run per entry, each entry overriding [params]
//! [[sequence]]
//! temperature_setpoint = 4.2
//!
//! [[sequence]]
//! temperature_setpoint = 10.0
//! field_setpoint = 0.5
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use crate::error::{AppResult, DaqError};

// =============================================================================
// ConfigValue
// =============================================================================

/// Untyped parameter value as written in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Integer(i64),
    /// Float.
    Float(f64),
    /// String.
    String(String),
    /// Array.
    Array(Vec<ConfigValue>),
}

impl ConfigValue {
    /// As boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// As float; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// As string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// As list of floats; a scalar becomes a one-element list.
    pub fn as_f64_list(&self) -> Option<Vec<f64>> {
        match self {
            ConfigValue::Array(items) => items.iter().map(ConfigValue::as_f64).collect(),
            scalar => scalar.as_f64().map(|v| vec![v]),
        }
    }

    /// Parse a command-line literal: bool, integer, float, `[a, b]`, else string.
    pub fn parse_literal(text: &str) -> Self {
        let text = text.trim();
        if let Ok(v) = text.parse::<bool>() {
            return ConfigValue::Bool(v);
        }
        if let Ok(v) = text.parse::<i64>() {
            return ConfigValue::Integer(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return ConfigValue::Float(v);
        }
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            return ConfigValue::Array(
                inner
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ConfigValue::parse_literal)
                    .collect(),
            );
        }
        ConfigValue::String(text.to_string())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Integer(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::String(v) => write!(f, "\"{v}\""),
            ConfigValue::Array(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Integer(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}

impl From<Vec<f64>> for ConfigValue {
    fn from(v: Vec<f64>) -> Self {
        ConfigValue::Array(v.into_iter().map(ConfigValue::Float).collect())
    }
}

// =============================================================================
// ProcedureConfig
// =============================================================================

/// Parameters of one procedure run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureConfig {
    /// Registry type id (`curve`, `current_iv`).
    #[serde(rename = "type")]
    pub procedure_type: String,
    /// Human-readable run name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Named parameters.
    #[serde(default)]
    pub params: HashMap<String, ConfigValue>,
    /// Per-run parameter overrides; empty means a single run.
    #[serde(default)]
    pub sequence: Vec<HashMap<String, ConfigValue>>,
}

#[derive(Debug, Deserialize)]
struct RawProcedureFile {
    procedure: ProcedureSection,
    #[serde(default)]
    params: HashMap<String, ConfigValue>,
    #[serde(default)]
    sequence: Vec<HashMap<String, ConfigValue>>,
}

#[derive(Debug, Deserialize)]
struct ProcedureSection {
    #[serde(rename = "type")]
    procedure_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
}

impl ProcedureConfig {
    /// Empty configuration for a type.
    pub fn new(procedure_type: impl Into<String>) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            name: String::new(),
            description: None,
            params: HashMap::new(),
            sequence: Vec::new(),
        }
    }

    /// Builder-style parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set_param(name, value);
        self
    }

    /// Load a procedure file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse a procedure document.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let raw: RawProcedureFile = toml::from_str(content)?;
        Ok(Self {
            procedure_type: raw.procedure.procedure_type,
            name: raw.procedure.name,
            description: raw.procedure.description,
            params: raw.params,
            sequence: raw.sequence,
        })
    }

    /// Set a parameter.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<ConfigValue>) {
        self.params.insert(name.into(), value.into());
    }

    /// Apply a `name=value` override from the command line.
    pub fn apply_override(&mut self, assignment: &str) -> AppResult<()> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            DaqError::configuration(format!("Override '{assignment}' is not of the form name=value"))
        })?;
        let name = name.trim().trim_start_matches("params.");
        if name.is_empty() {
            return Err(DaqError::configuration(format!(
                "Override '{assignment}' has an empty name"
            )));
        }
        self.set_param(name, ConfigValue::parse_literal(value));
        Ok(())
    }

    /// Raw parameter.
    pub fn get_param(&self, name: &str) -> Option<&ConfigValue> {
        self.params.get(name)
    }

    /// Float parameter, `default` when absent; present with another type is an error.
    pub fn f64_or(&self, name: &str, default: f64) -> AppResult<f64> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| type_error(name, "a number", v)),
        }
    }

    /// Boolean parameter, `default` when absent.
    pub fn bool_or(&self, name: &str, default: bool) -> AppResult<bool> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| type_error(name, "a boolean", v)),
        }
    }

    /// String parameter, `default` when absent.
    pub fn str_or<'a>(&'a self, name: &str, default: &'a str) -> AppResult<&'a str> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v.as_str().ok_or_else(|| type_error(name, "a string", v)),
        }
    }

    /// List of floats, `default` when absent.
    pub fn f64_list_or(&self, name: &str, default: &[f64]) -> AppResult<Vec<f64>> {
        match self.params.get(name) {
            None => Ok(default.to_vec()),
            Some(v) => v
                .as_f64_list()
                .ok_or_else(|| type_error(name, "a number or list of numbers", v)),
        }
    }

    /// Parameter names not in `known`, sorted.
    pub fn unknown_params(&self, known: &[&str]) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .params
            .keys()
            .chain(self.sequence.iter().flat_map(HashMap::keys))
            .filter(|k| !known.contains(&k.as_str()))
            .collect();
        names.into_iter().cloned().collect()
    }

    /// One configuration per sequence entry (itself when there is no sequence).
    pub fn expand_sequence(&self) -> Vec<ProcedureConfig> {
        if self.sequence.is_empty() {
            return vec![self.clone()];
        }
        self.sequence
            .iter()
            .map(|entry| {
                let mut run = self.clone();
                run.sequence.clear();
                for (name, value) in entry {
                    run.params.insert(name.clone(), value.clone());
                }
                run
            })
            .collect()
    }
}

fn type_error(name: &str, expected: &str, found: &ConfigValue) -> DaqError {
    DaqError::configuration(format!(
        "Parameter '{name}' must be {expected}, got {found}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
        [procedure]
        type = "curve"
        name = "gate sweep"

        [params]
        drain_currents = [1e-6, 2e-6]
        gate_stop = 10
        sample = "TBG-07"

        [[sequence]]
        temperature_setpoint = 4.2

        [[sequence]]
        temperature_setpoint = 10.0
        sample = "TBG-08"
    "#;

    #[test]
    fn parses_sections_and_typed_params() {
        let config = ProcedureConfig::from_toml_str(FILE).unwrap();
        assert_eq!(config.procedure_type, "curve");
        assert_eq!(config.name, "gate sweep");
        assert_eq!(config.f64_or("gate_stop", 60.0).unwrap(), 10.0);
        assert_eq!(config.f64_or("gate_start", 0.0).unwrap(), 0.0);
        assert_eq!(
            config.f64_list_or("drain_currents", &[]).unwrap(),
            vec![1e-6, 2e-6]
        );
        assert!(config.f64_or("sample", 0.0).unwrap_err().is_configuration());
    }

    #[test]
    fn sequence_entries_override_params() {
        let runs = ProcedureConfig::from_toml_str(FILE).unwrap().expand_sequence();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].f64_or("temperature_setpoint", 300.0).unwrap(), 4.2);
        assert_eq!(runs[0].str_or("sample", "blank").unwrap(), "TBG-07");
        assert_eq!(runs[1].str_or("sample", "blank").unwrap(), "TBG-08");
        assert!(runs.iter().all(|r| r.sequence.is_empty()));
    }

    #[test]
    fn overrides_parse_literals() {
        let mut config = ProcedureConfig::new("current_iv");
        config.apply_override("drain_step=5e-6").unwrap();
        config.apply_override("params.temperature_control=true").unwrap();
        config.apply_override("sample=flake 3").unwrap();
        config.apply_override("gate_voltages=[0, 1.5]").unwrap();

        assert_eq!(config.f64_or("drain_step", 0.0).unwrap(), 5e-6);
        assert!(config.bool_or("temperature_control", false).unwrap());
        assert_eq!(config.str_or("sample", "").unwrap(), "flake 3");
        assert_eq!(
            config.f64_list_or("gate_voltages", &[]).unwrap(),
            vec![0.0, 1.5]
        );
        assert!(config.apply_override("no-equals").is_err());
    }

    #[test]
    fn unknown_params_are_reported() {
        let config = ProcedureConfig::from_toml_str(FILE).unwrap();
        let unknown = config.unknown_params(&["drain_currents", "gate_stop", "temperature_setpoint"]);
        assert_eq!(unknown, vec!["sample"]);
    }

    #[test]
    fn missing_procedure_section_is_a_toml_error() {
        let err = ProcedureConfig::from_toml_str("[params]\nx = 1").unwrap_err();
        assert!(matches!(err, DaqError::Toml(_)));
    }
}
