//! Best-effort normalization of webhook payloads.
//!
//! Gateway rows carry the original webhook body in whatever shape the
//! producer forwarded: the native format (`type` + `action` pair), the
//! gateway format (compound dotted `event_type`), camelCase or snake_case
//! field names, and one or more levels of `payload`/`data` wrapping. Nothing
//! here validates a schema; every extractor tries an ordered list of known
//! shapes and returns the first non-empty match.

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::event::CanonicalEvent;
use crate::event::EventKind;
use crate::event::GatewayEvent;

/// Wrapper keys merged into the top level, in precedence order. Inner values
/// win on key collision.
const WRAPPER_KEYS: [&str; 2] = ["payload", "data"];

/// Bound on wrapper merging so a payload that re-wraps itself still
/// terminates.
const MAX_UNWRAP_DEPTH: usize = 6;

/// Event types that request cancellation of the session's in-flight run.
pub const STOP_EVENT_TYPES: [&str; 3] = [
    "agent_session.stopped",
    "agent_session.canceled",
    "agent_session.cancelled",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing agent session id in event payload")]
    MissingSessionId,
}

/// Merge nested `payload`/`data` wrapper objects into a single flat object.
///
/// Idempotent: once neither wrapper key maps to an object the input is
/// returned as-is. Non-object input normalizes to an empty object.
#[must_use]
pub fn unwrap_payload(payload: &Value) -> Map<String, Value> {
    let mut out = payload.as_object().cloned().unwrap_or_default();
    for _ in 0..MAX_UNWRAP_DEPTH {
        let wrapped = WRAPPER_KEYS.iter().find_map(|key| match out.get(*key) {
            Some(Value::Object(inner)) => Some((*key, inner.clone())),
            _ => None,
        });
        let Some((key, inner)) = wrapped else {
            break;
        };
        out.remove(key);
        out.extend(inner);
    }
    out
}

/// Map both accepted event-type shapes onto the canonical dotted form.
///
/// The native shape is a fixed type name plus a separate action
/// (`("AgentSessionEvent", "created")`); the gateway shape embeds the action
/// (`"agentsessionevent.created"`). Anything else passes through lowercased.
#[must_use]
pub fn normalize_event_type(event_type: &str, action: Option<&str>) -> String {
    let raw_lower = event_type.to_lowercase();
    if raw_lower == "agentsessionevent" {
        return match action {
            Some(action) => format!("agent_session.{}", action.to_lowercase()),
            None => String::new(),
        };
    }
    if let Some(action) = raw_lower.strip_prefix("agentsessionevent.") {
        return format!("agent_session.{action}");
    }
    raw_lower
}

fn trimmed(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        _ => None,
    }
}

fn nonempty_str(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

/// First of `keys` that maps to an object.
fn object_at<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_object))
}

fn trimmed_at(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| map.get(*key).and_then(trimmed))
}

pub fn extract_session_id(payload: &Map<String, Value>) -> Option<String> {
    if let Some(session) = object_at(payload, &["agentSession", "agent_session"])
        && let Some(id) = session.get("id").and_then(nonempty_str)
    {
        return Some(id);
    }
    if let Some(id) = payload
        .get("agentSessionId")
        .or_else(|| payload.get("agent_session_id"))
        .and_then(nonempty_str)
    {
        return Some(id);
    }
    // A bare issue webhook carries the session id at the top level.
    if payload.contains_key("issue")
        && let Some(id) = payload.get("id").and_then(nonempty_str)
    {
        return Some(id);
    }
    None
}

pub fn extract_issue_title(payload: &Map<String, Value>) -> Option<String> {
    if let Some(session) = object_at(payload, &["agentSession", "agent_session"])
        && let Some(issue) = session.get("issue").and_then(Value::as_object)
        && let Some(title) = issue.get("title").and_then(trimmed)
    {
        return Some(title);
    }
    if let Some(issue) = payload.get("issue").and_then(Value::as_object)
        && let Some(title) = issue.get("title").and_then(trimmed)
    {
        return Some(title);
    }
    trimmed_at(payload, &["issueTitle", "issue_title"])
}

/// Byte offset of the first ASCII-case-insensitive occurrence of `needle` in
/// `haystack` at or after `start`. The needles used here are pure ASCII, so a
/// returned offset always sits on a char boundary.
fn find_ascii_ci(haystack: &str, needle: &str, start: usize) -> Option<usize> {
    haystack
        .as_bytes()
        .get(start..)?
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
        .map(|position| start + position)
}

/// Scan the prompt-context blob for an embedded `<title>…</title>` tag.
pub fn extract_issue_title_from_prompt_context(payload: &Map<String, Value>) -> Option<String> {
    let context = payload
        .get("promptContext")
        .or_else(|| payload.get("prompt_context"))
        .and_then(Value::as_str)?;
    let open = find_ascii_ci(context, "<title>", 0)? + "<title>".len();
    let close = find_ascii_ci(context, "</title>", open)?;
    let title = context[open..close].trim();
    if title.is_empty() || title.contains('<') {
        return None;
    }
    Some(title.to_string())
}

pub fn extract_project_id(payload: &Map<String, Value>) -> Option<String> {
    let session = object_at(payload, &["agentSession", "agent_session"])?;
    let issue = session.get("issue").and_then(Value::as_object)?;
    if let Some(project) = issue.get("project").and_then(Value::as_object)
        && let Some(id) = project.get("id").and_then(trimmed)
    {
        return Some(id);
    }
    trimmed_at(issue, &["projectId", "project_id"])
}

pub fn extract_issue_id(payload: &Map<String, Value>) -> Option<String> {
    if let Some(session) = object_at(payload, &["agentSession", "agent_session"])
        && let Some(issue) = session.get("issue").and_then(Value::as_object)
        && let Some(id) = trimmed_at(issue, &["id", "issueId", "issue_id"])
    {
        return Some(id);
    }
    if let Some(issue) = payload.get("issue").and_then(Value::as_object)
        && let Some(id) = issue.get("id").and_then(trimmed)
    {
        return Some(id);
    }
    trimmed_at(payload, &["issueId", "issue_id"])
}

/// Typed content keys that may nest the actual body one level down, e.g.
/// `{"type": "message", "message": {"body": "…"}}`.
const NESTED_CONTENT_KEYS: [&str; 6] = [
    "prompt",
    "message",
    "thought",
    "elicitation",
    "response",
    "error",
];

fn text_from_activity_content(content: &Map<String, Value>) -> Option<String> {
    if let Some(body) = trimmed_at(content, &["body", "text"]) {
        return Some(body);
    }
    for key in NESTED_CONTENT_KEYS {
        if let Some(nested) = content.get(key).and_then(Value::as_object)
            && let Some(body) = trimmed_at(nested, &["body", "text"])
        {
            return Some(body);
        }
    }
    match content.get("action") {
        Some(Value::Object(action)) => {
            let name = trimmed_at(action, &["action", "type"]);
            let parameter = trimmed_at(action, &["parameter", "body", "text"]);
            if name.as_deref() == Some("message") {
                return parameter;
            }
            None
        }
        Some(action) => {
            let name = trimmed(action);
            let parameter = content.get("parameter").and_then(trimmed);
            if name.as_deref() == Some("message") {
                return parameter;
            }
            None
        }
        None => None,
    }
}

/// Resolve the user-visible body of an agent activity, whatever its shape:
/// plain string, flat `body`, typed nested content, or JSON-string-encoded
/// content.
pub fn extract_activity_body(activity: &Value) -> Option<String> {
    let activity = match activity {
        Value::String(_) => return trimmed(activity),
        Value::Object(map) => map,
        _ => return None,
    };
    if let Some(body) = activity.get("body").and_then(trimmed) {
        return Some(body);
    }
    let content = match activity.get("content") {
        Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded).ok()?,
        Some(content) => content.clone(),
        None => return None,
    };
    content.as_object().and_then(text_from_activity_content)
}

pub fn extract_prompt_body(payload: &Map<String, Value>) -> Option<String> {
    if let Some(activity) = payload
        .get("agentActivity")
        .or_else(|| payload.get("agent_activity"))
        && let Some(body) = extract_activity_body(activity)
    {
        return Some(body);
    }
    let context = payload
        .get("promptContext")
        .or_else(|| payload.get("prompt_context"))?;
    if let Some(body) = trimmed(context) {
        return Some(body);
    }
    context
        .as_object()
        .and_then(|context| trimmed_at(context, &["body", "text"]))
}

pub fn extract_activity_id(payload: &Map<String, Value>) -> Option<String> {
    if let Some(activity) = payload
        .get("agentActivity")
        .or_else(|| payload.get("agent_activity"))
        .and_then(Value::as_object)
        && let Some(id) = trimmed_at(activity, &["id", "agentActivityId", "agent_activity_id"])
    {
        return Some(id);
    }
    trimmed_at(payload, &["agentActivityId", "agent_activity_id"])
}

/// Normalize one gateway event into its canonical form.
///
/// Unrecognized event types yield [`EventKind::Ignored`]; recognized types
/// without a resolvable session id are an error (the event cannot be
/// correlated and is marked failed by the caller).
pub fn canonicalize(event: &GatewayEvent) -> Result<CanonicalEvent, NormalizeError> {
    let payload = unwrap_payload(&event.payload);

    let raw_type = if event.event_type.is_empty() {
        payload
            .get("event_type")
            .or_else(|| payload.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    } else {
        event.event_type.clone()
    };
    let action = payload.get("action").and_then(Value::as_str);
    let normalized = normalize_event_type(&raw_type, action);

    let kind = match normalized.as_str() {
        "agent_session.created" => EventKind::Created,
        "agent_session.prompted" => EventKind::Prompted,
        stop if STOP_EVENT_TYPES.contains(&stop) => EventKind::Stopped,
        _ => return Ok(CanonicalEvent::ignored()),
    };

    let session_id = extract_session_id(&payload).ok_or(NormalizeError::MissingSessionId)?;

    Ok(CanonicalEvent {
        kind,
        session_id,
        prompt_text: extract_prompt_body(&payload),
        issue_title: extract_issue_title(&payload)
            .or_else(|| extract_issue_title_from_prompt_context(&payload)),
        issue_id: extract_issue_id(&payload),
        project_id: extract_project_id(&payload),
        activity_id: extract_activity_id(&payload),
    })
}
