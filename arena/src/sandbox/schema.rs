//! Agent action validation against the JSON Schema.

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::core::types::Direction;

pub const AGENT_ACTION_SCHEMA: &str = include_str!("../../schemas/agent_action.schema.json");

/// Compiled action schema (Draft 2020-12).
pub struct ActionValidator {
    compiled: Validator,
}

impl ActionValidator {
    pub fn new() -> Result<Self> {
        let schema: Value =
            serde_json::from_str(AGENT_ACTION_SCHEMA).context("parse agent action schema")?;
        let compiled = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|err| anyhow!("compile agent action schema: {err}"))?;
        Ok(Self { compiled })
    }

    /// Validate an agent's raw output and extract the direction.
    ///
    /// `Ok(None)` is a deliberate idle (`null`); schema violations are errors.
    pub fn parse_action(&self, output: &Value) -> Result<Option<Direction>> {
        let messages: Vec<String> = self
            .compiled
            .iter_errors(output)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!("schema validation failed:\n- {}", messages.join("\n- "));
        }
        let name = match output {
            Value::Null => return Ok(None),
            Value::String(name) => name.as_str(),
            Value::Object(map) => map
                .get("direction")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("action object missing direction"))?,
            other => bail!("unexpected action shape {other}"),
        };
        Direction::from_name(name)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown direction {name:?}"))
    }
}
