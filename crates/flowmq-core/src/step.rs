// Workflow step model and routing-key formatting
//
// A step names its prerequisite patterns (`in`), its success fanout (`out`)
// and its failure fanout (`fail`). The `split` and `enrich` keywords are
// reserved and currently inert.

use serde::{Deserialize, Deserializer, Serialize};

use crate::history::HistoryRecord;

/// Prerequisite pattern on a step input
///
/// Unrecognized wire values decode as `Unknown`, which no evaluation ever
/// satisfies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PatternIn {
    /// Requires a chain of ancestor steps to have completed
    #[serde(rename = "aggregate-pattern-in")]
    Aggregate,
    /// No additional gating
    #[serde(rename = "passthrough-pattern-in")]
    Passthrough,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl<'de> Deserialize<'de> for PatternIn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match String::deserialize(deserializer)?.as_str() {
            "aggregate-pattern-in" => PatternIn::Aggregate,
            "passthrough-pattern-in" => PatternIn::Passthrough,
            _ => PatternIn::Unknown,
        })
    }
}

/// Fanout pattern on a step output
///
/// Unrecognized wire values decode as `Unknown`, which dispatches nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PatternOut {
    /// Reserved
    #[serde(rename = "split-pattern-out")]
    Split,
    /// Publish the successor start message as-is
    #[serde(rename = "passthrough-pattern-out")]
    Passthrough,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl<'de> Deserialize<'de> for PatternOut {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match String::deserialize(deserializer)?.as_str() {
            "split-pattern-out" => PatternOut::Split,
            "passthrough-pattern-out" => PatternOut::Passthrough,
            _ => PatternOut::Unknown,
        })
    }
}

/// One prerequisite on a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepIn {
    #[serde(default)]
    pub pattern: PatternIn,
    /// How far down the correlation chain an aggregate looks
    #[serde(default)]
    pub depth: usize,
}

impl StepIn {
    pub fn passthrough() -> Self {
        StepIn {
            pattern: PatternIn::Passthrough,
            depth: 0,
        }
    }

    pub fn aggregate(depth: usize) -> Self {
        StepIn {
            pattern: PatternIn::Aggregate,
            depth,
        }
    }
}

/// One fanout action on a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOut {
    #[serde(default)]
    pub pattern: PatternOut,
    /// Index into `Flow::steps` the successor starts at
    #[serde(default)]
    pub next_step: usize,
    /// Business tag recorded in history when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<HistoryRecord>,
    /// Reserved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrich: Vec<String>,
}

impl StepOut {
    pub fn passthrough(next_step: usize) -> Self {
        StepOut {
            pattern: PatternOut::Passthrough,
            next_step,
            record: None,
            enrich: Vec::new(),
        }
    }

    pub fn with_record(mut self, record: HistoryRecord) -> Self {
        self.record = Some(record);
        self
    }
}

/// One node in the workflow program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Runs no user code; completion is inferred in process
    #[serde(default)]
    pub auto_propagate: bool,
    #[serde(rename = "in", default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<StepIn>,
    #[serde(rename = "out", default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<StepOut>,
    #[serde(rename = "fail", default, skip_serializing_if = "Vec::is_empty")]
    pub fail_outputs: Vec<StepOut>,
}

impl Step {
    /// Routing key that triggers the start of this step.
    pub fn in_key(&self, workflow: &str) -> String {
        format!("flow.{workflow}.{}.start", self.name)
    }

    /// Routing key that signals the end of this step.
    pub fn out_key(&self, workflow: &str) -> String {
        format!("flow.{workflow}.{}.end", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_keys() {
        let step = Step {
            name: "resize".into(),
            ..Default::default()
        };

        assert_eq!(step.in_key("images"), "flow.images.resize.start");
        assert_eq!(step.out_key("images"), "flow.images.resize.end");
    }

    #[test]
    fn test_pattern_wire_names() {
        let json = serde_json::to_string(&PatternIn::Aggregate).unwrap();
        assert_eq!(json, "\"aggregate-pattern-in\"");

        let json = serde_json::to_string(&PatternOut::Passthrough).unwrap();
        assert_eq!(json, "\"passthrough-pattern-out\"");
    }

    #[test]
    fn test_unrecognized_pattern_decodes_as_unknown() {
        let pattern: PatternIn = serde_json::from_str("\"enrich-pattern-in\"").unwrap();
        assert_eq!(pattern, PatternIn::Unknown);

        let pattern: PatternOut = serde_json::from_str("\"split-pattern-out\"").unwrap();
        assert_eq!(pattern, PatternOut::Split);
    }

    #[test]
    fn test_missing_fields_default() {
        let step: Step = serde_json::from_str(r#"{ "name": "solo" }"#).unwrap();

        assert!(!step.auto_propagate);
        assert!(step.inputs.is_empty());
        assert!(step.outputs.is_empty());
        assert!(step.fail_outputs.is_empty());
    }
}
