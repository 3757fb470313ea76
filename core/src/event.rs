use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

/// One durably queued webhook delivery, exactly as claimed from the gateway
/// table. Read-only in this process; the upstream producer owns the row shape.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub external_id: Option<String>,
    pub payload: Value,
    pub created_at: Option<DateTime<Utc>>,
}

/// Canonical lifecycle classification of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Prompted,
    Stopped,
    Ignored,
}

/// Shape-independent view of a gateway event, produced by the normalizer.
///
/// `session_id` is empty only for [`EventKind::Ignored`]; every recognized
/// event type carries one.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub prompt_text: Option<String>,
    pub issue_title: Option<String>,
    pub issue_id: Option<String>,
    pub project_id: Option<String>,
    pub activity_id: Option<String>,
}

impl CanonicalEvent {
    pub(crate) fn ignored() -> Self {
        Self {
            kind: EventKind::Ignored,
            session_id: String::new(),
            prompt_text: None,
            issue_title: None,
            issue_id: None,
            project_id: None,
            activity_id: None,
        }
    }
}

/// Agent activity content type accepted by the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Thought,
    Action,
    Elicitation,
    Response,
    Error,
}

impl ActivityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::Thought => "thought",
            ActivityType::Action => "action",
            ActivityType::Elicitation => "elicitation",
            ActivityType::Response => "response",
            ActivityType::Error => "error",
        }
    }

    /// Only thought and action activities may be marked ephemeral; the remote
    /// API rejects the flag on terminal content types.
    #[must_use]
    pub fn may_be_ephemeral(self) -> bool {
        matches!(self, ActivityType::Thought | ActivityType::Action)
    }
}

/// One unit of visible output to post under a session, with its structured
/// content payload already assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub activity_type: ActivityType,
    pub content: Value,
    pub ephemeral: Option<bool>,
}

impl Activity {
    fn body_content(activity_type: ActivityType, body: &str) -> Value {
        json!({
            "type": activity_type.as_str(),
            activity_type.as_str(): { "body": body },
        })
    }

    #[must_use]
    pub fn thought(body: &str) -> Self {
        Self {
            activity_type: ActivityType::Thought,
            content: Self::body_content(ActivityType::Thought, body),
            ephemeral: None,
        }
    }

    /// Ephemeral thoughts are replaced by subsequent activities in the remote
    /// UI; used for progress chatter.
    #[must_use]
    pub fn ephemeral_thought(body: &str) -> Self {
        Self {
            ephemeral: Some(true),
            ..Self::thought(body)
        }
    }

    #[must_use]
    pub fn response(body: &str) -> Self {
        Self {
            activity_type: ActivityType::Response,
            content: Self::body_content(ActivityType::Response, body),
            ephemeral: None,
        }
    }

    #[must_use]
    pub fn error(body: &str) -> Self {
        Self {
            activity_type: ActivityType::Error,
            content: Self::body_content(ActivityType::Error, body),
            ephemeral: None,
        }
    }

    #[must_use]
    pub fn action(action: &str, parameter: &str) -> Self {
        Self {
            activity_type: ActivityType::Action,
            content: json!({
                "type": "action",
                "action": { "action": action, "parameter": parameter },
            }),
            ephemeral: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Completed,
    Canceled,
}

/// One entry of the session plan shown alongside the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub content: String,
    pub status: PlanStepStatus,
}

impl PlanStep {
    #[must_use]
    pub fn new(content: &str, status: PlanStepStatus) -> Self {
        Self {
            content: content.to_string(),
            status,
        }
    }
}
