//! HTTP routes.
//!
//! | Method | Path | |
//! |---|---|---|
//! | `GET` | `/` | welcome message |
//! | `GET` | `/health` | liveness |
//! | `POST` | `/jobs` | submit a job |
//! | `GET` | `/jobs/stats` | queue counts |
//! | `GET` | `/jobs/dead-letter` | dead-letter records |

use crate::error::ApiError;
use crate::state::{AppState, DEAD_LETTER_LIMIT, JOB_NAME};
use bytes::Bytes;
use chrono::Utc;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, Limited};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use stevedore_queue::EnqueueOptions;
use tracing::{error, info};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 100 * 1024;

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJob {
    message: Option<String>,
    #[serde(default)]
    should_fail: bool,
    priority: Option<i32>,
    max_attempts: Option<u32>,
}

type ApiResult = Result<(StatusCode, Value), ApiError>;

/// Serve one request. Never fails; errors become JSON error responses.
pub async fn handle<B>(req: Request<B>, state: AppState) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("[{}] {} {}", state.pid, method, req.uri());

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(&ApiError::BadRequest(format!(
                "Failed to read request body: {e}"
            ))));
        }
    };

    let response = match dispatch(&state, &method, &path, body).await {
        Ok((status, value)) => json_response(status, &value),
        Err(err) => {
            if let ApiError::Internal(detail) = &err {
                error!(method = %method, path = %path, error = %detail, "Unhandled error");
            }
            error_response(&err)
        }
    };
    Ok(response)
}

async fn dispatch(state: &AppState, method: &Method, path: &str, body: Bytes) -> ApiResult {
    match (method, path) {
        (&Method::GET, "/") => Ok(welcome(state)),
        (&Method::GET, "/health") => Ok(health(state)),
        (&Method::POST, "/jobs") => submit_job(state, &body).await,
        (&Method::GET, "/jobs/stats") => stats(state).await,
        (&Method::GET, "/jobs/dead-letter") => dead_letters(state).await,
        _ => Err(ApiError::NotFound),
    }
}

fn welcome(state: &AppState) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "message": "Welcome to the Multi-Core API Server!",
            "workerPID": state.pid,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn health(state: &AppState) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "status": "ok",
            "uptime": state.uptime(),
            "pid": state.pid,
        }),
    )
}

async fn submit_job(state: &AppState, body: &[u8]) -> ApiResult {
    let request: SubmitJob = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))?;

    let mut payload = serde_json::Map::new();
    if let Some(message) = request.message {
        payload.insert("message".to_string(), Value::String(message));
    }
    payload.insert("shouldFail".to_string(), Value::Bool(request.should_fail));

    let mut options = EnqueueOptions::default();
    if let Some(priority) = request.priority {
        options = options.priority(priority);
    }
    if let Some(max_attempts) = request.max_attempts {
        options = options.max_attempts(max_attempts);
    }

    let job = state
        .queue
        .enqueue(JOB_NAME, Value::Object(payload), options)
        .await?;

    Ok((
        StatusCode::CREATED,
        json!({ "jobId": job.id, "success": true }),
    ))
}

async fn stats(state: &AppState) -> ApiResult {
    let stats = state.queue.stats().await?;
    let value = serde_json::to_value(stats).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::OK, value))
}

async fn dead_letters(state: &AppState) -> ApiResult {
    let records = state.queue.dead_letters(DEAD_LETTER_LIMIT).await?;
    Ok((
        StatusCode::OK,
        json!({ "count": records.len(), "records": records }),
    ))
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(err: &ApiError) -> Response<Full<Bytes>> {
    json_response(err.status_code(), &err.body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stevedore_queue::{JobQueue, JobState, MemoryBroker, QueueConfig};

    fn state() -> (AppState, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let queue = JobQueue::new(broker.clone(), QueueConfig::default().require_field("message"));
        (AppState::new(queue), broker)
    }

    async fn call(state: &AppState, method: Method, path: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = handle(req, state.clone()).await.unwrap();
        let status = response.status();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_welcome() {
        let (state, _) = state();
        let (status, body) = call(&state, Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Welcome to the Multi-Core API Server!");
        assert_eq!(body["workerPID"], std::process::id());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state();
        let (status, body) = call(&state, Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["uptime"].as_f64().unwrap() >= 0.0);
        assert_eq!(body["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_submit_job() {
        let (state, _) = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/jobs",
            r#"{"message": "hello", "priority": 2, "maxAttempts": 5}"#,
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);

        let id = body["jobId"].as_str().unwrap().parse().unwrap();
        let job = state.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.name, JOB_NAME);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.priority, 2);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.payload, json!({"message": "hello", "shouldFail": false}));
    }

    #[tokio::test]
    async fn test_submit_job_rejects_bad_input() {
        let (state, _) = state();
        for body in [
            r#"{}"#,
            r#"{"message": ""}"#,
            r#"{"message": "   ", "shouldFail": true}"#,
            r#"{"message": 42}"#,
            r#"{"message": "hi", "maxAttempts": 0}"#,
            r#"{"message": "hi", "priority": "high"}"#,
            "not json",
            "",
        ] {
            let (status, response) = call(&state, Method::POST, "/jobs", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert!(response["error"].is_string());
        }

        let stats = state.queue.stats().await.unwrap();
        assert_eq!(stats.waiting_count, 0);
    }

    #[tokio::test]
    async fn test_missing_message_error() {
        let (state, _) = state();
        let (_, body) = call(&state, Method::POST, "/jobs", r#"{"shouldFail": true}"#).await;
        assert_eq!(body["error"], "Validation error: message is required");
    }

    #[tokio::test]
    async fn test_stats() {
        let (state, _) = state();
        call(&state, Method::POST, "/jobs", r#"{"message": "a"}"#).await;
        call(&state, Method::POST, "/jobs", r#"{"message": "b"}"#).await;

        let (status, body) = call(&state, Method::GET, "/jobs/stats", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "waitingCount": 2,
                "activeCount": 0,
                "completedCount": 0,
                "failedCount": 0,
                "deadLetterCount": 0,
            })
        );
    }

    #[tokio::test]
    async fn test_broker_outage_is_503() {
        let (state, broker) = state();
        broker.set_unavailable(true);

        let (status, _) = call(&state, Method::POST, "/jobs", r#"{"message": "a"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = call(&state, Method::GET, "/jobs/stats", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dead_letter_listing() {
        let (state, _) = state();
        let job = stevedore_queue::Job::new("dummy-jobs", JOB_NAME, json!({"message": "x"}));
        state.queue.move_to_dead_letter(&job, "Simulated job failure").await.unwrap();

        let (status, body) = call(&state, Method::GET, "/jobs/dead-letter", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["jobId"], job.id.to_string());
        assert_eq!(
            body["records"][0]["failureReason"],
            "max retries exceeded: Simulated job failure"
        );
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (state, _) = state();
        for (method, path) in [
            (Method::GET, "/nope"),
            (Method::DELETE, "/jobs"),
            (Method::GET, "/jobs"),
        ] {
            let (status, body) = call(&state, method, path, "").await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body, json!({"error": "Not found"}));
        }
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let (state, _) = state();
        let body = format!(r#"{{"message": "{}"}}"#, "x".repeat(MAX_BODY_BYTES));
        let (status, _) = call(&state, Method::POST, "/jobs", &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
