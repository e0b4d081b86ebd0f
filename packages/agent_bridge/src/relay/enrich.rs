//! Best-effort annotation of agent events.
//!
//! Each annotated field has a prioritized table of pure extraction rules;
//! the first rule that produces a value wins. Nothing here can stop an event
//! from being forwarded.

use serde_json::{Map, Value};
use thiserror::Error;

use super::render::markdown_to_html;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("event is not a JSON object")]
    NotAnObject,
}

/// Pure extraction from an event
pub type Rule = fn(&Value) -> Option<String>;

/// A field and the rules that can fill it, highest priority first
pub struct ExtractionRule {
    pub field: &'static str,
    pub rules: &'static [Rule],
}

impl ExtractionRule {
    pub fn extract(&self, event: &Value) -> Option<String> {
        self.rules.iter().find_map(|rule| rule(event))
    }
}

pub const TOOL_NAME: ExtractionRule = ExtractionRule {
    field: "tool_name",
    rules: &[
        explicit_tool_name,
        tool_call_key,
        tool_use_block_name,
        typed_event_name,
    ],
};

pub const FILE_PATH: ExtractionRule = ExtractionRule {
    field: "file_path",
    rules: &[
        tool_call_args_path,
        tool_use_block_file_path,
        top_level_path,
    ],
};

/// Substrings marking a tool that changes files
const EDIT_TOOL_MARKERS: &[&str] = &["edit", "write", "replace", "patch", "create", "delete"];

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn explicit_tool_name(event: &Value) -> Option<String> {
    non_empty_str(event.get("tool_name"))
}

/// `{"tool_call": {"editToolCall": {...}}}` names the tool by its only key
fn tool_call_key(event: &Value) -> Option<String> {
    let call = event.get("tool_call")?.as_object()?;
    let mut keys = call.keys();
    let key = keys.next()?;
    if keys.next().is_some() {
        return None;
    }
    Some(normalize_tool_key(key))
}

fn normalize_tool_key(key: &str) -> String {
    let base = key.strip_suffix("ToolCall").unwrap_or(key);
    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => key.to_string(),
    }
}

fn content_blocks(event: &Value) -> impl Iterator<Item = &Value> {
    event
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn first_tool_use_block(event: &Value) -> Option<&Value> {
    content_blocks(event).find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
}

fn tool_use_block_name(event: &Value) -> Option<String> {
    non_empty_str(first_tool_use_block(event)?.get("name"))
}

fn typed_event_name(event: &Value) -> Option<String> {
    match event.get("type").and_then(Value::as_str) {
        Some("tool_call" | "tool_use") => non_empty_str(event.get("name")),
        _ => None,
    }
}

fn tool_call_args_path(event: &Value) -> Option<String> {
    let call = event.get("tool_call")?.as_object()?;
    call.values().find_map(|inner| {
        let args = inner.get("args")?;
        non_empty_str(args.get("path")).or_else(|| non_empty_str(args.get("file_path")))
    })
}

fn tool_use_block_file_path(event: &Value) -> Option<String> {
    let input = first_tool_use_block(event)?.get("input")?;
    non_empty_str(input.get("file_path")).or_else(|| non_empty_str(input.get("path")))
}

fn top_level_path(event: &Value) -> Option<String> {
    non_empty_str(event.get("file_path")).or_else(|| non_empty_str(event.get("path")))
}

pub fn is_edit_tool(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    EDIT_TOOL_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Concatenated text blocks of an assistant message
pub fn assistant_text(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let text: String = content_blocks(event)
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

/// Per-command enrichment state.
///
/// Holds the distinct tools seen so far; create a fresh one for each command.
#[derive(Debug, Default)]
pub struct Enricher {
    tools_called: Vec<String>,
}

impl Enricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tools_called(&self) -> &[String] {
        &self.tools_called
    }

    /// Annotate `event` in place. Existing fields are never overwritten.
    pub fn enrich(&mut self, event: &mut Value) -> Result<(), EnrichmentError> {
        if !event.is_object() {
            return Err(EnrichmentError::NotAnObject);
        }

        let tool_name = TOOL_NAME.extract(event);
        let file_path = tool_name
            .as_deref()
            .filter(|name| is_edit_tool(name))
            .and_then(|_| FILE_PATH.extract(event));
        let markdown = assistant_text(event);

        if let Some(name) = &tool_name {
            if !self.tools_called.contains(name) {
                self.tools_called.push(name.clone());
            }
        }

        let Some(fields) = event.as_object_mut() else {
            return Err(EnrichmentError::NotAnObject);
        };

        if let Some(name) = tool_name {
            insert_missing(fields, TOOL_NAME.field, Value::String(name));
            insert_missing(
                fields,
                "tools_called",
                Value::Array(
                    self.tools_called
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect(),
                ),
            );
        }
        if let Some(path) = file_path {
            insert_missing(fields, FILE_PATH.field, Value::String(path));
        }
        if let Some(text) = markdown {
            insert_missing(fields, "html", Value::String(markdown_to_html(&text)));
            insert_missing(fields, "markdown", Value::String(text));
        }
        Ok(())
    }
}

fn insert_missing(fields: &mut Map<String, Value>, key: &str, value: Value) {
    if !fields.contains_key(key) {
        fields.insert(key.to_string(), value);
    }
}
