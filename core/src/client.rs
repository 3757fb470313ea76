//! Outbound remote API client (GraphQL over HTTP), throttled by the
//! sliding-window limiter.
//!
//! The business schema is consumed through four narrow operations: post an
//! activity under a session, update the session plan/state, fetch an issue,
//! and fetch an activity (the remote prompt-body fallback). Transport
//! failures and structured error responses fold into one [`ApiError`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::event::Activity;
use crate::event::PlanStep;
use crate::limiter::RateLimiter;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("api returned invalid JSON: {body}")]
    InvalidJson { body: String },
    #[error("api reported errors: {errors}")]
    Graphql { errors: Value },
    #[error("api response missing {field}")]
    MissingField { field: &'static str },
    #[error("api client construction failed: {0}")]
    Build(#[source] reqwest::Error),
}

/// The outbound operations the bridge consumes. Implemented by [`ApiClient`]
/// for production and by in-memory fakes in tests.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Post one activity under a session; returns the created activity id.
    async fn create_activity(&self, session_id: &str, activity: &Activity)
    -> Result<String, ApiError>;

    /// Replace the session's plan.
    async fn set_plan(&self, session_id: &str, steps: &[PlanStep]) -> Result<(), ApiError>;

    async fn get_issue(&self, issue_id: &str) -> Result<Value, ApiError>;

    async fn get_activity(&self, activity_id: &str) -> Result<Value, ApiError>;
}

/// Production client. Every call passes through `limiter.acquire()` before
/// touching the network.
pub struct ApiClient {
    http: reqwest::Client,
    api_url: String,
    limiter: RateLimiter,
}

impl ApiClient {
    pub fn new(
        token: &str,
        api_url: &str,
        max_requests: usize,
        window: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ApiError::MissingField { field: "api token" })?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(ApiError::Build)?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            limiter: RateLimiter::new(max_requests, window),
        })
    }

    /// Execute one GraphQL operation and return its `data` object.
    pub async fn graphql(
        &self,
        query: &str,
        variables: Value,
        operation_name: &str,
    ) -> Result<Map<String, Value>, ApiError> {
        self.limiter.acquire().await;
        let request = json!({
            "query": query,
            "variables": variables,
            "operationName": operation_name,
        });
        let response = self.http.post(&self.api_url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() >= 400 {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        let parsed: Value =
            serde_json::from_str(&body).map_err(|_| ApiError::InvalidJson { body })?;
        if let Some(errors) = parsed.get("errors")
            && !errors.is_null()
        {
            return Err(ApiError::Graphql {
                errors: errors.clone(),
            });
        }
        match parsed.get("data") {
            Some(Value::Object(data)) => Ok(data.clone()),
            _ => Err(ApiError::MissingField { field: "data" }),
        }
    }

    /// Auth smoke-check used at startup; returns the acting identity.
    pub async fn get_viewer(&self) -> Result<Value, ApiError> {
        let query = r"
        query Me {
          viewer {
            id
            name
            email
          }
        }
        ";
        let data = self.graphql(query, json!({}), "Me").await?;
        data.get("viewer")
            .filter(|viewer| viewer.is_object())
            .cloned()
            .ok_or(ApiError::MissingField { field: "viewer" })
    }

    async fn update_session(&self, session_id: &str, data: Value) -> Result<(), ApiError> {
        let query = r"
        mutation AgentSessionUpdate($agentSessionId: String!, $data: AgentSessionUpdateInput!) {
          agentSessionUpdate(id: $agentSessionId, input: $data) {
            success
            agentSession {
              id
              state
            }
          }
        }
        ";
        let result = self
            .graphql(
                query,
                json!({ "agentSessionId": session_id, "data": data }),
                "AgentSessionUpdate",
            )
            .await?;
        let success = result
            .get("agentSessionUpdate")
            .and_then(|update| update.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            return Err(ApiError::MissingField {
                field: "agentSessionUpdate.success",
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn create_activity(
        &self,
        session_id: &str,
        activity: &Activity,
    ) -> Result<String, ApiError> {
        let query = r"
        mutation AgentActivityCreate($input: AgentActivityCreateInput!) {
          agentActivityCreate(input: $input) {
            success
            agentActivity {
              id
            }
          }
        }
        ";
        let mut input = json!({
            "agentSessionId": session_id,
            "content": activity.content,
        });
        if let Some(ephemeral) = activity.ephemeral.filter(|_| activity.activity_type.may_be_ephemeral())
            && let Some(input) = input.as_object_mut()
        {
            input.insert("ephemeral".to_string(), Value::Bool(ephemeral));
        }
        let data = self
            .graphql(query, json!({ "input": input }), "AgentActivityCreate")
            .await?;
        let created = data
            .get("agentActivityCreate")
            .and_then(Value::as_object)
            .ok_or(ApiError::MissingField {
                field: "agentActivityCreate",
            })?;
        if created.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(ApiError::MissingField {
                field: "agentActivityCreate.success",
            });
        }
        created
            .get("agentActivity")
            .and_then(|activity| activity.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ApiError::MissingField {
                field: "agentActivity.id",
            })
    }

    async fn set_plan(&self, session_id: &str, steps: &[PlanStep]) -> Result<(), ApiError> {
        self.update_session(session_id, json!({ "plan": steps })).await
    }

    async fn get_issue(&self, issue_id: &str) -> Result<Value, ApiError> {
        let query = r"
        query Issue($id: String!) {
          issue(id: $id) {
            id
            title
            identifier
            url
            project { id name }
            state { id name type }
          }
        }
        ";
        let data = self.graphql(query, json!({ "id": issue_id }), "Issue").await?;
        data.get("issue")
            .filter(|issue| issue.is_object())
            .cloned()
            .ok_or(ApiError::MissingField { field: "issue" })
    }

    async fn get_activity(&self, activity_id: &str) -> Result<Value, ApiError> {
        let query = r"
        query AgentActivity($id: String!) {
          agentActivity(id: $id) {
            id
            content
          }
        }
        ";
        let data = self
            .graphql(query, json!({ "id": activity_id }), "AgentActivity")
            .await?;
        data.get("agentActivity")
            .filter(|activity| activity.is_object())
            .cloned()
            .ok_or(ApiError::MissingField {
                field: "agentActivity",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PlanStepStatus;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::Request;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(
            "test-token",
            &format!("{}/graphql", server.uri()),
            0,
            Duration::from_secs(3600),
        )
        .expect("client")
    }

    fn request_body(request: &Request) -> Value {
        serde_json::from_slice(&request.body).expect("request body")
    }

    #[tokio::test]
    async fn viewer_sends_auth_header_and_operation_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "viewer": { "id": "u1", "name": "Kai" } },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let viewer = client(&server).get_viewer().await.expect("viewer");
        assert_eq!(viewer["id"], "u1");

        let requests = server.received_requests().await.expect("requests");
        let body = request_body(&requests[0]);
        assert_eq!(body["operationName"], "Me");
        assert!(body["query"].as_str().expect("query").contains("viewer"));
    }

    #[tokio::test]
    async fn create_activity_sends_content_and_ephemeral() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "agentActivityCreate": {
                        "success": true,
                        "agentActivity": { "id": "a1" },
                    },
                },
            })))
            .mount(&server)
            .await;

        let id = client(&server)
            .create_activity("s1", &Activity::ephemeral_thought("hi"))
            .await
            .expect("activity id");
        assert_eq!(id, "a1");

        let requests = server.received_requests().await.expect("requests");
        let input = &request_body(&requests[0])["variables"]["input"];
        assert_eq!(input["agentSessionId"], "s1");
        assert_eq!(input["ephemeral"], true);
        assert_eq!(input["content"]["type"], "thought");
        assert_eq!(input["content"]["thought"]["body"], "hi");
    }

    #[tokio::test]
    async fn ephemeral_is_dropped_for_terminal_activities() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "agentActivityCreate": {
                        "success": true,
                        "agentActivity": { "id": "a1" },
                    },
                },
            })))
            .mount(&server)
            .await;

        let mut activity = Activity::error("boom");
        activity.ephemeral = Some(true);
        client(&server)
            .create_activity("s1", &activity)
            .await
            .expect("activity id");

        let requests = server.received_requests().await.expect("requests");
        let input = &request_body(&requests[0])["variables"]["input"];
        assert!(input.get("ephemeral").is_none());
    }

    #[tokio::test]
    async fn set_plan_uses_session_update() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "agentSessionUpdate": {
                        "success": true,
                        "agentSession": { "id": "s1", "state": "active" },
                    },
                },
            })))
            .mount(&server)
            .await;

        client(&server)
            .set_plan(
                "s1",
                &[PlanStep::new("Analyze request", PlanStepStatus::InProgress)],
            )
            .await
            .expect("plan");

        let requests = server.received_requests().await.expect("requests");
        let body = request_body(&requests[0]);
        assert_eq!(body["operationName"], "AgentSessionUpdate");
        assert_eq!(body["variables"]["agentSessionId"], "s1");
        assert_eq!(
            body["variables"]["data"]["plan"][0]["content"],
            "Analyze request"
        );
        assert_eq!(body["variables"]["data"]["plan"][0]["status"], "inProgress");
    }

    #[tokio::test]
    async fn get_activity_queries_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "agentActivity": {
                        "id": "a1",
                        "content": { "body": "hello" },
                    },
                },
            })))
            .mount(&server)
            .await;

        let activity = client(&server).get_activity("a1").await.expect("activity");
        assert_eq!(activity["content"]["body"], "hello");

        let requests = server.received_requests().await.expect("requests");
        let body = request_body(&requests[0]);
        assert_eq!(body["operationName"], "AgentActivity");
        assert_eq!(body["variables"]["id"], "a1");
    }

    #[tokio::test]
    async fn graphql_errors_map_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{ "message": "not found" }],
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_issue("missing")
            .await
            .expect_err("graphql error");
        assert!(matches!(err, ApiError::Graphql { .. }));
    }

    #[tokio::test]
    async fn http_failures_map_to_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client(&server).get_viewer().await.expect_err("http error");
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
