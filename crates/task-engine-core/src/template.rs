// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Template Resolver (spec.md §4.1).
//!
//! Substitutes `{{stepN.path}}` / `{{NOW}}` references, preserves the two
//! sentinel markers, and merges per-step user inputs before substitution.
//! Grounded on the recursive `Value`-tree placeholder substitution in
//! `other_examples/..OpenIntentOS..executor.rs::resolve_placeholders`,
//! generalised to the dotted/bracketed path grammar in `path.rs`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::model::StepOutput;
use crate::path::{self, Segment};

/// Left unresolved by design: a human must supply this value.
pub const SENTINEL_PROMPT_USER: &str = "{{PROMPT_USER}}";
/// Left unresolved by design: the `ValueGenerator` must supply this value.
pub const SENTINEL_GENERATE: &str = "{{GENERATE}}";

/// Which sentinel a leaf holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    PromptUser,
    Generate,
}

impl Sentinel {
    fn of(s: &str) -> Option<Self> {
        match s {
            SENTINEL_PROMPT_USER => Some(Sentinel::PromptUser),
            SENTINEL_GENERATE => Some(Sentinel::Generate),
            _ => None,
        }
    }
}

/// Everything the resolver needs to turn `{{..}}` references into values.
pub struct ExecutionContext<'a> {
    pub step_outputs: &'a BTreeMap<String, StepOutput>,
    pub now: DateTime<Utc>,
}

/// Stateless template resolver; all methods take their context explicitly.
pub struct TemplateResolver;

impl TemplateResolver {
    /// Resolves `parameters` for `step_id`, after merging `user_inputs` for
    /// that step at their dotted paths.
    pub fn resolve(
        parameters: &Value,
        user_inputs_for_step: Option<&BTreeMap<String, Value>>,
        step_id: &str,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Value> {
        let mut merged = parameters.clone();
        if let Some(inputs) = user_inputs_for_step {
            for (field_path, value) in inputs {
                path::set(&mut merged, field_path, value.clone());
            }
        }
        resolve_value(&merged, step_id, ctx)
    }

    /// True if any leaf in `value` is exactly one of the two sentinel
    /// strings.
    pub fn contains_sentinel(value: &Value) -> bool {
        match value {
            Value::String(s) => Sentinel::of(s).is_some(),
            Value::Array(arr) => arr.iter().any(Self::contains_sentinel),
            Value::Object(map) => map.values().any(Self::contains_sentinel),
            _ => false,
        }
    }

    /// Returns `(dotted_path, sentinel_kind)` for every sentinel leaf in
    /// `value`, preserving array indices in brackets.
    pub fn extract_sentinels(value: &Value) -> Vec<(String, Sentinel)> {
        let mut out = Vec::new();
        collect_sentinels(value, String::new(), &mut out);
        out
    }
}

fn collect_sentinels(value: &Value, prefix: String, out: &mut Vec<(String, Sentinel)>) {
    match value {
        Value::String(s) => {
            if let Some(kind) = Sentinel::of(s) {
                out.push((prefix, kind));
            }
        }
        Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                collect_sentinels(v, path, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                collect_sentinels(v, path, out);
            }
        }
        _ => {}
    }
}

fn resolve_value(value: &Value, step_id: &str, ctx: &ExecutionContext<'_>) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, step_id, ctx),
        Value::Array(arr) => {
            let mut resolved = Vec::with_capacity(arr.len());
            for item in arr {
                resolved.push(resolve_value(item, step_id, ctx)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_value(v, step_id, ctx)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, step_id: &str, ctx: &ExecutionContext<'_>) -> Result<Value> {
    // Sentinel leaves are whole-string by construction (a PlanStep's
    // parameter leaves are "scalars or the two sentinel strings" per the
    // data model) - check that before touching the template scanner.
    if Sentinel::of(s).is_some() {
        return Ok(Value::String(s.to_string()));
    }

    let matches = find_templates(s);
    if matches.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // Whole-string reference: substitute with the raw resolved value so
    // non-string types (numbers, objects, arrays) round-trip intact.
    if matches.len() == 1 {
        let (start, end, inner) = &matches[0];
        if s[..*start].is_empty() && s[*end..].is_empty() {
            return resolve_reference(inner, step_id, ctx);
        }
    }

    // Otherwise interpolate each reference in place, stringified.
    let mut out = String::new();
    let mut last = 0;
    for (start, end, inner) in &matches {
        out.push_str(&s[last..*start]);
        let resolved = resolve_reference(inner, step_id, ctx)?;
        match resolved {
            Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        last = *end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Resolves the inner text of one `{{ .. }}` expression.
fn resolve_reference(inner: &str, step_id: &str, ctx: &ExecutionContext<'_>) -> Result<Value> {
    let trimmed = inner.trim();
    if trimmed == "NOW" {
        return Ok(Value::String(ctx.now.to_rfc3339()));
    }

    let segments = path::parse(trimmed);
    let Some(Segment::Key(ref_step_id)) = segments.first() else {
        return Err(EngineError::Template {
            step_id: step_id.to_string(),
            reason: format!("malformed template reference '{{{{{inner}}}}}'"),
        });
    };

    let step_output = ctx.step_outputs.get(ref_step_id).ok_or_else(|| EngineError::Template {
        step_id: step_id.to_string(),
        reason: format!("reference to unresolved step '{ref_step_id}'"),
    })?;

    if segments.len() == 1 {
        return serde_json::to_value(step_output).map_err(EngineError::from);
    }

    let envelope = serde_json::to_value(step_output)?;
    path::get_by_segments(&envelope, &segments[1..])
        .cloned()
        .ok_or_else(|| EngineError::Template {
            step_id: step_id.to_string(),
            reason: format!("path '{trimmed}' not found in output of step '{ref_step_id}'"),
        })
}

/// Scans `s` for non-overlapping `{{ .. }}` spans, returning
/// `(start, end, inner)` byte ranges (`end` excludes the closing braces'
/// trailing edge, i.e. `&s[start..end]` is the full `{{..}}` span).
fn find_templates(s: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(close) = s[i + 2..].find("}}") {
                let end = i + 2 + close + 2;
                out.push((i, end, &s[i + 2..i + 2 + close]));
                i = end;
                continue;
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepOutput;
    use serde_json::json;

    fn ctx(outputs: BTreeMap<String, StepOutput>) -> ExecutionContext<'static> {
        // Leak is fine in tests: keeps lifetimes simple.
        let outputs: &'static BTreeMap<String, StepOutput> = Box::leak(Box::new(outputs));
        ExecutionContext {
            step_outputs: outputs,
            now: Utc::now(),
        }
    }

    #[test]
    fn resolves_whole_string_step_reference_preserving_type() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "step1".to_string(),
            StepOutput::success(json!([{"_id": "f1"}])),
        );
        let c = ctx(outputs);

        let params = json!({"facilityId": "{{step1.output[0]._id}}"});
        let resolved = TemplateResolver::resolve(&params, None, "step2", &c).unwrap();
        assert_eq!(resolved["facilityId"], json!("f1"));
    }

    #[test]
    fn leaves_sentinels_untouched() {
        let c = ctx(BTreeMap::new());
        let params = json!({"source": SENTINEL_PROMPT_USER, "id": SENTINEL_GENERATE});
        let resolved = TemplateResolver::resolve(&params, None, "step2", &c).unwrap();
        assert_eq!(resolved["source"], json!(SENTINEL_PROMPT_USER));
        assert_eq!(resolved["id"], json!(SENTINEL_GENERATE));
        assert!(TemplateResolver::contains_sentinel(&resolved));
    }

    #[test]
    fn extract_sentinels_preserves_bracket_paths() {
        let c = ctx(BTreeMap::new());
        let params = json!({"items": [{"name": SENTINEL_PROMPT_USER}], "id": SENTINEL_GENERATE});
        let resolved = TemplateResolver::resolve(&params, None, "step1", &c).unwrap();
        let mut found = TemplateResolver::extract_sentinels(&resolved);
        found.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(found[0].0, "id");
        assert_eq!(found[1].0, "items[0].name");
    }

    #[test]
    fn missing_step_output_is_template_error() {
        let c = ctx(BTreeMap::new());
        let params = json!({"x": "{{step1.output}}"});
        let err = TemplateResolver::resolve(&params, None, "step2", &c).unwrap_err();
        assert!(matches!(err, EngineError::Template { .. }));
    }

    #[test]
    fn empty_list_index_reference_is_template_error() {
        let mut outputs = BTreeMap::new();
        outputs.insert("step1".to_string(), StepOutput::success(json!([])));
        let c = ctx(outputs);
        let params = json!({"x": "{{step1.output[0].name}}"});
        let err = TemplateResolver::resolve(&params, None, "step2", &c).unwrap_err();
        assert!(matches!(err, EngineError::Template { .. }));
    }

    #[test]
    fn now_resolves_to_iso8601() {
        let c = ctx(BTreeMap::new());
        let params = json!({"ts": "{{NOW}}"});
        let resolved = TemplateResolver::resolve(&params, None, "step1", &c).unwrap();
        assert!(resolved["ts"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn embedded_reference_is_stringified() {
        let mut outputs = BTreeMap::new();
        outputs.insert("step1".to_string(), StepOutput::success(json!("data")));
        let c = ctx(outputs);
        let params = json!({"msg": "prefix_{{step1.output}}_suffix"});
        let resolved = TemplateResolver::resolve(&params, None, "step2", &c).unwrap();
        assert_eq!(resolved["msg"], json!("prefix_data_suffix"));
    }

    #[test]
    fn user_inputs_override_before_substitution() {
        let c = ctx(BTreeMap::new());
        let mut inputs = BTreeMap::new();
        inputs.insert("source".to_string(), json!("Acme"));
        let params = json!({"source": SENTINEL_PROMPT_USER});
        let resolved = TemplateResolver::resolve(&params, Some(&inputs), "step2", &c).unwrap();
        assert_eq!(resolved["source"], json!("Acme"));
    }
}
