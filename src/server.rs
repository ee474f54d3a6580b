//! HTTP/JSON API server.
//!
//! The handlers are deliberately thin: request validation is a pure function
//! over the raw headers and body, writes go to the scheduler mailbox, and
//! the list endpoints read the persistent state directly (no read-after-write
//! consistency is promised for them).

use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::task;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::archive::Archive;
use crate::catalog::TestCatalog;
use crate::job::Job;
use crate::scheduler::SchedulerHandle;

/// Value of the `Server` response header.
pub const SERVER_TOKEN: &str = "Pote/0.1";

/// Requests bigger than this are rejected outright.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub catalog: Arc<TestCatalog>,
    pub archive: Archive,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/envo", get(envos))
        .route("/test", get(tests))
        .route("/job", get(jobs).post(submit_job))
        .route("/archive", get(archived))
        .fallback(not_found)
        .layer(middleware::from_fn(allow_get_post))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_TOKEN),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject every verb other than GET and POST before routing.
async fn allow_get_post(request: Request, next: Next) -> Response {
    if request.method() != Method::GET && request.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, POST")],
            "Method Not Allowed\n",
        )
            .into_response();
    }
    next.run(request).await
}

async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn envos(State(state): State<AppState>) -> Json<usize> {
    Json(state.scheduler.envos_count())
}

async fn tests(State(state): State<AppState>) -> Json<Vec<String>> {
    let catalog = Arc::clone(&state.catalog);
    let mut names = task::spawn_blocking(move || catalog.available())
        .await
        .unwrap_or_default();
    names.sort();
    Json(names)
}

async fn jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, Internal> {
    let scheduler = state.scheduler.clone();
    let jobs = task::spawn_blocking(move || scheduler.queued())
        .await
        .context("queue read task died")??;
    Ok(Json(jobs))
}

async fn archived(State(state): State<AppState>) -> Result<Json<Vec<Job>>, Internal> {
    let archive = state.archive.clone();
    let jobs = task::spawn_blocking(move || archive.dump())
        .await
        .context("archive read task died")??;
    Ok(Json(jobs))
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<String>), Rejection> {
    let submission = parse_job_request(
        &headers,
        &body,
        state.scheduler.envos_count(),
        state.catalog.as_ref(),
    )?;
    let job = Job::new(submission.user, submission.envo, submission.test);
    let job_id = job.id.clone();
    debug!(job_id = %job_id, "new job request accepted");
    state.scheduler.notify_job_add(job);
    Ok((StatusCode::CREATED, Json(job_id)))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found\n").into_response()
}

/// A validated POST /job submission.
#[derive(Debug, PartialEq, Eq)]
pub struct JobSubmission {
    pub user: String,
    pub envo: usize,
    pub test: String,
}

/// Validation failure, rendered as a plain-text response.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: &'static str,
}

impl Rejection {
    fn bad_request(reason: &'static str) -> Rejection {
        Rejection {
            status: StatusCode::BAD_REQUEST,
            reason,
        }
    }

    fn unsupported_media(reason: &'static str) -> Rejection {
        Rejection {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            reason,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.reason)).into_response()
    }
}

/// Validate a POST /job request without touching the scheduler. Only
/// `Content-Length`-framed `application/json` bodies holding an object with
/// a non-empty `user`, an `envo` in range and a known `test` pass.
pub fn parse_job_request(
    headers: &HeaderMap,
    body: &[u8],
    envos_count: usize,
    catalog: &TestCatalog,
) -> Result<JobSubmission, Rejection> {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return Err(Rejection::bad_request("Chunked transfer not supported"));
    }
    if body.is_empty() {
        return Err(Rejection::bad_request("Bad request object"));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .ok_or_else(|| Rejection::unsupported_media("Content-Type not defined"))?;
    let main_type = content_type
        .to_str()
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    if !main_type.eq_ignore_ascii_case("application/json") {
        return Err(Rejection::unsupported_media(
            "Unsupported Content-Type. Use application/json",
        ));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(Rejection::bad_request("Request entity too large"));
    }
    let request: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| Rejection::bad_request("Bad JSON"))?;
    let request = request
        .as_object()
        .ok_or_else(|| Rejection::bad_request("Bad request object"))?;
    let user = request
        .get("user")
        .and_then(|value| value.as_str())
        .filter(|user| !user.is_empty())
        .ok_or_else(|| Rejection::bad_request("Bad user name"))?;
    let envo = request
        .get("envo")
        .and_then(|value| value.as_u64())
        .and_then(|envo| usize::try_from(envo).ok())
        .filter(|envo| *envo < envos_count)
        .ok_or_else(|| Rejection::bad_request("Bad environment ID"))?;
    let test = request
        .get("test")
        .and_then(|value| value.as_str())
        .ok_or_else(|| Rejection::bad_request("Bad test set name"))?;
    if !catalog.contains(test) {
        return Err(Rejection::bad_request("Bad test set name"));
    }
    Ok(JobSubmission {
        user: user.to_string(),
        envo,
        test: test.to_string(),
    })
}

/// Internal failure on a read path, rendered as a 500.
struct Internal(anyhow::Error);

impl From<anyhow::Error> for Internal {
    fn from(err: anyhow::Error) -> Internal {
        Internal(err)
    }
}

impl IntoResponse for Internal {
    fn into_response(self) -> Response {
        tracing::error!(error = %format!("{:#}", self.0), "request handler crashed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::Scheduler;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// Spin up a full application state over a temp directory tree, with
    /// one installed test (`fast_good`) and three slots.
    fn state() -> (tempfile::TempDir, AppState) {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let tests_path = tmp.path().join("tests");
        std::fs::create_dir_all(&tests_path).unwrap();
        std::fs::write(tests_path.join("fast_good.sh"), "exit 0\n").unwrap();
        let config = Config {
            envos_path: tmp.path().join("envos"),
            tests_path: tests_path.clone(),
            queue_path: tmp.path().join("queue"),
            archive_path: tmp.path().join("archive"),
            ..Config::default()
        };
        let archive = Archive::new(&config.archive_path);
        let catalog = Arc::new(TestCatalog::new(&tests_path));
        let scheduler = Scheduler::spawn(&config, Arc::clone(&catalog), archive.clone());
        (
            tmp,
            AppState {
                scheduler,
                catalog,
                archive,
            },
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    // ── router ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ping_replies_no_content_with_server_header() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .uri("/ping")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::SERVER).unwrap(),
            SERVER_TOKEN
        );
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .uri("/nothing")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_verbs_are_rejected_with_allow_header() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/job")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET, POST");
    }

    #[tokio::test]
    async fn envo_reports_the_slot_count() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .uri("/envo")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_lists_available_names() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .uri("/test")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!(["fast_good"]));
    }

    #[tokio::test]
    async fn submit_returns_created_with_a_job_id() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/job")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"user": "u", "envo": 0, "test": "fast_good"}"#,
            ))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job_id = body_json(response).await;
        let job_id = job_id.as_str().unwrap();
        assert_eq!(job_id.len(), 32);
        assert!(job_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn submit_without_json_content_type_is_unsupported() {
        let (_tmp, state) = state();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/job")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("user=u"))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    // ── validation ─────────────────────────────────────────────────────────

    fn catalog_with(names: &[&str]) -> (tempfile::TempDir, TestCatalog) {
        let tmp = tempfile::tempdir().expect("create tempdir");
        for name in names {
            std::fs::write(tmp.path().join(format!("{name}.sh")), "exit 0\n").unwrap();
        }
        let catalog = TestCatalog::new(tmp.path().to_path_buf());
        (tmp, catalog)
    }

    #[test]
    fn valid_submission_passes() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        let parsed = parse_job_request(
            &json_headers(),
            br#"{"user": "alice", "envo": 2, "test": "smoke"}"#,
            3,
            &catalog,
        );
        assert_eq!(
            parsed,
            Ok(JobSubmission {
                user: "alice".to_string(),
                envo: 2,
                test: "smoke".to_string(),
            })
        );
    }

    #[test]
    fn empty_body_is_a_bad_request() {
        let (_tmp, catalog) = catalog_with(&[]);
        let parsed = parse_job_request(&json_headers(), b"", 3, &catalog);
        assert_eq!(parsed.unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_content_type_is_unsupported_media() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        let parsed = parse_job_request(
            &HeaderMap::new(),
            br#"{"user": "u", "envo": 0, "test": "smoke"}"#,
            3,
            &catalog,
        );
        assert_eq!(
            parsed.unwrap_err().status,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn content_type_parameters_are_tolerated() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let parsed = parse_job_request(
            &headers,
            br#"{"user": "u", "envo": 0, "test": "smoke"}"#,
            3,
            &catalog,
        );
        assert!(parsed.is_ok());
    }

    #[test]
    fn chunked_framing_is_rejected() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        let mut headers = json_headers();
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        let parsed = parse_job_request(
            &headers,
            br#"{"user": "u", "envo": 0, "test": "smoke"}"#,
            3,
            &catalog,
        );
        assert_eq!(parsed.unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn malformed_json_is_a_bad_request() {
        let (_tmp, catalog) = catalog_with(&[]);
        let parsed = parse_job_request(&json_headers(), b"{oops", 3, &catalog);
        assert_eq!(parsed.unwrap_err().reason, "Bad JSON");
    }

    #[test]
    fn non_object_body_is_a_bad_request() {
        let (_tmp, catalog) = catalog_with(&[]);
        let parsed = parse_job_request(&json_headers(), b"[1, 2]", 3, &catalog);
        assert_eq!(parsed.unwrap_err().reason, "Bad request object");
    }

    #[test]
    fn empty_user_is_rejected() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        let parsed = parse_job_request(
            &json_headers(),
            br#"{"user": "", "envo": 0, "test": "smoke"}"#,
            3,
            &catalog,
        );
        assert_eq!(parsed.unwrap_err().reason, "Bad user name");
    }

    #[test]
    fn envo_must_be_inside_the_pool() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        for body in [
            br#"{"user": "u", "envo": 3, "test": "smoke"}"#.as_slice(),
            br#"{"user": "u", "envo": -1, "test": "smoke"}"#.as_slice(),
            br#"{"user": "u", "envo": "0", "test": "smoke"}"#.as_slice(),
        ] {
            let parsed = parse_job_request(&json_headers(), body, 3, &catalog);
            assert_eq!(parsed.unwrap_err().reason, "Bad environment ID");
        }
    }

    #[test]
    fn unknown_test_is_rejected() {
        let (_tmp, catalog) = catalog_with(&["smoke"]);
        let parsed = parse_job_request(
            &json_headers(),
            br#"{"user": "u", "envo": 0, "test": "other"}"#,
            3,
            &catalog,
        );
        assert_eq!(parsed.unwrap_err().reason, "Bad test set name");
    }
}
