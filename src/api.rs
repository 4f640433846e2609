//! HTTP front end: maps `/v1/<mount>/<path>` onto the engine router and
//! exposes the metrics registry.

use crate::acme::translate_error;
use crate::backend::Backend;
use crate::error::PkiError;
use crate::handlers::{handle_request, is_acme_path, Operation, Request, Response};
use crate::metrics::PrometheusSink;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use warp::http::{Method, StatusCode};
use warp::path::Tail;
use warp::{Filter, Rejection, Reply};

/// Optional header naming the caller, used by `allow_token_displayname` roles.
pub const DISPLAY_NAME_HEADER: &str = "x-rustpki-display-name";

/// JSON body of successful engine responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub data: Option<Value>,
    pub warnings: Option<Vec<String>>,
    pub lease_duration: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<String>,
}

/// HTTP server for one mounted engine.
pub struct PkiApi {
    backend: Arc<Backend>,
    metrics: Arc<PrometheusSink>,
    mount_path: String,
}

impl PkiApi {
    pub fn new(
        backend: Arc<Backend>,
        metrics: Arc<PrometheusSink>,
        mount_path: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            metrics,
            mount_path: mount_path.into().trim_matches('/').to_string(),
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        let engine = warp::path("v1")
            .and(warp::path(self.mount_path.clone()))
            .and(warp::path::tail())
            .and(warp::method())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::header::optional::<String>(DISPLAY_NAME_HEADER))
            .and(warp::body::bytes())
            .and(with_backend(self.backend.clone()))
            .and_then(handle_engine);

        let metrics = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_metrics(self.metrics.clone()))
            .and_then(handle_metrics);

        metrics
            .or(engine)
            .with(warp::trace::request())
            .recover(handle_rejection)
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| PkiError::Config(format!("unable to bind {addr}: {e}")))?;
        info!("Serving PKI engine at http://{}/v1/{}/", bound, self.mount_path);
        server.await;
        info!("HTTP server stopped");
        Ok(())
    }
}

fn with_backend(
    backend: Arc<Backend>,
) -> impl Filter<Extract = (Arc<Backend>,), Error = Infallible> + Clone {
    warp::any().map(move || backend.clone())
}

fn with_metrics(
    metrics: Arc<PrometheusSink>,
) -> impl Filter<Extract = (Arc<PrometheusSink>,), Error = Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

/// GET reads (or lists with `?list=true`), POST and PUT update, DELETE
/// deletes and the `LIST` verb lists.
fn operation_for(method: &Method, query: &HashMap<String, String>) -> Option<Operation> {
    let list_query = query.get("list").map(|v| v == "true" || v == "1").unwrap_or(false);
    match method.as_str() {
        "GET" if list_query => Some(Operation::List),
        "GET" => Some(Operation::Read),
        "POST" | "PUT" => Some(Operation::Update),
        "DELETE" => Some(Operation::Delete),
        "LIST" => Some(Operation::List),
        _ => None,
    }
}

fn request_data(
    body: &Bytes,
    query: HashMap<String, String>,
    operation: Operation,
) -> Result<Map<String, Value>> {
    let mut data = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(PkiError::user("request body must be a JSON object")),
            Err(e) => return Err(PkiError::user(format!("failed to parse JSON input: {e}"))),
        }
    };
    if operation == Operation::Read {
        for (k, v) in query {
            if k != "list" {
                data.entry(k).or_insert(Value::String(v));
            }
        }
    }
    Ok(data)
}

async fn handle_engine(
    tail: Tail,
    method: Method,
    query: HashMap<String, String>,
    display_name: Option<String>,
    body: Bytes,
    backend: Arc<Backend>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    let path = tail.as_str().to_string();
    let Some(operation) = operation_for(&method, &query) else {
        return Ok(error_reply(
            &path,
            &PkiError::user(format!("unsupported method {method}")),
            StatusCode::METHOD_NOT_ALLOWED,
        ));
    };

    let data = match request_data(&body, query, operation) {
        Ok(data) => data,
        Err(e) => return Ok(error_reply(&path, &e, StatusCode::BAD_REQUEST)),
    };
    let mut request = Request::new(operation, path.clone());
    request.data = data;
    request.display_name = display_name.unwrap_or_default();

    match handle_request(&backend, request).await {
        Ok(response) => Ok(success_reply(response)),
        Err(e) => {
            if e.is_user_error() {
                debug!("{:?} {} rejected: {}", operation, path, e);
            } else {
                error!("{:?} {} failed: {}", operation, path, e);
            }
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Ok(error_reply(&path, &e, status))
        }
    }
}

fn success_reply(response: Response) -> warp::reply::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);

    if let Some(raw) = response.raw {
        if raw.body.is_empty() {
            return StatusCode::NO_CONTENT.into_response();
        }
        let reply = warp::reply::with_header(raw.body, "content-type", raw.content_type);
        return warp::reply::with_status(reply, status).into_response();
    }

    if response.data.is_none() && response.warnings.is_empty() && status == StatusCode::OK {
        return StatusCode::NO_CONTENT.into_response();
    }

    let body = ApiResponse {
        data: response.data,
        warnings: (!response.warnings.is_empty()).then_some(response.warnings),
        lease_duration: response.lease_duration.unwrap_or(0),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

/// `{"errors": [...]}`, or an RFC 7807 problem document on ACME paths.
fn error_reply(path: &str, err: &PkiError, status: StatusCode) -> warp::reply::Response {
    if is_acme_path(path) {
        let (code, doc) = translate_error(err);
        let code = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let reply = warp::reply::with_header(
            warp::reply::json(&doc),
            "content-type",
            "application/problem+json",
        );
        return warp::reply::with_status(reply, code).into_response();
    }
    let body = ErrorResponse {
        errors: vec![err.to_string()],
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn handle_metrics(
    metrics: Arc<PrometheusSink>,
) -> std::result::Result<impl Reply, Rejection> {
    Ok(warp::reply::with_header(
        metrics.render(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "Not Found";
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Method Not Allowed";
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        code = StatusCode::BAD_REQUEST;
        message = "Invalid query string";
    } else {
        error!("Unhandled rejection: {:?}", err);
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal Server Error";
    }

    let json = warp::reply::json(&ErrorResponse {
        errors: vec![message.to_string()],
    });
    Ok(warp::reply::with_status(json, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::SystemView;
    use crate::storage::InMemoryStorage;
    use serde_json::json;
    use warp::test;

    fn api() -> PkiApi {
        let metrics = PrometheusSink::new();
        let backend = Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            metrics.clone(),
            "api-test",
        );
        PkiApi::new(backend, metrics, "pki")
    }

    #[test]
    fn test_operation_mapping() {
        let mut query = HashMap::new();
        assert_eq!(operation_for(&Method::GET, &query), Some(Operation::Read));
        assert_eq!(operation_for(&Method::PUT, &query), Some(Operation::Update));
        assert_eq!(
            operation_for(&Method::from_bytes(b"LIST").unwrap(), &query),
            Some(Operation::List)
        );
        assert_eq!(operation_for(&Method::PATCH, &query), None);
        query.insert("list".to_string(), "true".to_string());
        assert_eq!(operation_for(&Method::GET, &query), Some(Operation::List));
    }

    #[tokio::test]
    async fn test_empty_ca_is_no_content() {
        let filter = api().routes();
        let response = test::request()
            .method("GET")
            .path("/v1/pki/ca")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn test_role_write_and_list() {
        let filter = api().routes();
        let response = test::request()
            .method("POST")
            .path("/v1/pki/roles/web")
            .json(&json!({"allowed_domains": ["example.com"], "allow_subdomains": true}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.data.unwrap()["allowed_domains"], json!(["example.com"]));

        let response = test::request()
            .method("LIST")
            .path("/v1/pki/roles")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.data.unwrap()["keys"], json!(["web"]));
    }

    #[tokio::test]
    async fn test_user_error_body() {
        let filter = api().routes();
        let response = test::request()
            .method("POST")
            .path("/v1/pki/issue/missing")
            .json(&json!({"common_name": "a.example.com"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);
        let body: ErrorResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.errors, vec!["unknown role: missing".to_string()]);

        let response = test::request()
            .method("POST")
            .path("/v1/pki/roles/web")
            .body("{not json")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_acme_errors_are_problem_documents() {
        let filter = api().routes();
        let response = test::request()
            .method("POST")
            .path("/v1/pki/acme/mgmt/account/keyid/ghost")
            .json(&json!({"status": "revoked"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);
        assert_eq!(
            response.headers()["content-type"],
            "application/problem+json"
        );
        let doc: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(doc["type"], "urn:ietf:params:acme:error:accountDoesNotExist");
        assert!(doc["detail"].as_str().unwrap().contains("did not exist"));
    }

    #[tokio::test]
    async fn test_unknown_mount_and_metrics() {
        let filter = api().routes();
        let response = test::request()
            .method("GET")
            .path("/v1/other/ca")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 404);

        let response = test::request()
            .method("GET")
            .path("/metrics")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
    }
}
