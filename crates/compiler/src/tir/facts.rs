//! Type Facts Artifact ingestion
//!
//! An external checker can hand the compiler a JSON artifact of
//! per-symbol type facts. Facts are advisory by default (they seed the
//! inference and can only be confirmed or widened); under `strict` the
//! inference treats them as assertions and a mismatch is a compile
//! error (checked in [`super::infer`]).

use std::collections::HashMap;

use serde::Deserialize;

use crate::diag::{CompileError, Stage};

use super::infer::FuncSummary;
use super::types::Ty;

/// Artifact versions this compiler understands.
pub const FACTS_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct RawArtifact {
    version: u32,
    facts: Vec<RawFact>,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    symbol: String,
    #[serde(default)]
    params: Vec<String>,
    returns: String,
}

/// Parse a Type Facts Artifact into inference seeds.
pub fn parse_facts(json: &str) -> Result<HashMap<String, FuncSummary>, CompileError> {
    let raw: RawArtifact = serde_json::from_str(json).map_err(|e| {
        CompileError::new(Stage::Infer, format!("type facts artifact: {}", e), None)
    })?;
    if raw.version != FACTS_VERSION {
        return Err(CompileError::new(
            Stage::Infer,
            format!(
                "type facts artifact version {} (expected {})",
                raw.version, FACTS_VERSION
            ),
            None,
        ));
    }
    let mut seeds = HashMap::new();
    for fact in raw.facts {
        let params = fact
            .params
            .iter()
            .map(|p| parse_ty(p))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = parse_ty(&fact.returns)?;
        seeds.insert(fact.symbol, FuncSummary { params, ret });
    }
    Ok(seeds)
}

fn parse_ty(name: &str) -> Result<Ty, CompileError> {
    Ok(match name {
        "Int" => Ty::Int,
        "Float" => Ty::Float,
        "Bool" => Ty::Bool,
        "Str" => Ty::Str,
        "Bytes" => Ty::Bytes,
        "None" | "Null" => Ty::Null,
        "Any" | "Dynamic" => Ty::Dynamic,
        "List" => Ty::list(Ty::Dynamic),
        "Map" => Ty::map(Ty::Dynamic, Ty::Dynamic, None),
        "Set" => Ty::Set(Box::new(Ty::Dynamic)),
        "Tuple" => Ty::Dynamic,
        "Callable" => Ty::Callable { target: None },
        "Error" => Ty::Error,
        "Task" => Ty::Task,
        "Channel" => Ty::Channel,
        "Handle" => Ty::Handle,
        other => {
            return Err(CompileError::new(
                Stage::Infer,
                format!("type facts artifact: unknown type '{}'", other),
                None,
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artifact() {
        let json = r#"{
            "version": 1,
            "facts": [
                {"symbol": "m.f", "params": ["Int", "Str"], "returns": "Bool"},
                {"symbol": "m.g", "returns": "Any"}
            ]
        }"#;
        let seeds = parse_facts(json).unwrap();
        assert_eq!(seeds["m.f"].params, vec![Ty::Int, Ty::Str]);
        assert_eq!(seeds["m.f"].ret, Ty::Bool);
        assert_eq!(seeds["m.g"].params.len(), 0);
        assert_eq!(seeds["m.g"].ret, Ty::Dynamic);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let err = parse_facts(r#"{"version": 2, "facts": []}"#).unwrap_err();
        assert!(err.message.contains("version 2"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"version": 1, "facts": [{"symbol": "m.f", "returns": "Quux"}]}"#;
        let err = parse_facts(json).unwrap_err();
        assert!(err.message.contains("Quux"));
    }
}
