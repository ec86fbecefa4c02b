//! Service operations and the endpoint router.
//!
//! [`AnalyticsService`] exposes the analytics endpoints as typed
//! operations. [`AnalyticsService::handle`] maps a method, path and JSON
//! body onto them and turns error kinds into HTTP status codes, so any
//! HTTP server can sit in front of it.

use crate::error::{AnalyticsError, Result};
use crate::lifecycle::QueryManager;
use crate::models::{
    AnalyticsQuery, AnovaRequest, ChiSquareRequest, DescriptiveRequest, QueryHandle, QueryId,
    QueryPage, QueryParameters, QueryStatus, TTestRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Status code and JSON body of a routed request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(&AnalyticsError::internal(format!(
                "Failed to serialize response: {}",
                e
            ))),
        }
    }

    fn error(error: &AnalyticsError) -> Self {
        Self {
            status: error.kind.http_status(),
            body: json!({"kind": error.kind, "message": error.message}),
        }
    }

    fn plain(status: u16, kind: &str, message: String) -> Self {
        Self {
            status,
            body: json!({"kind": kind, "message": message}),
        }
    }
}

/// Typed analytics operations over a [`QueryManager`].
#[derive(Clone)]
pub struct AnalyticsService {
    manager: QueryManager,
}

impl AnalyticsService {
    pub fn new(manager: QueryManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &QueryManager {
        &self.manager
    }

    pub fn descriptive(&self, federation_id: &str, request: DescriptiveRequest) -> Result<QueryHandle> {
        self.manager
            .submit(federation_id, QueryParameters::Descriptive(request))
    }

    pub fn t_test(&self, federation_id: &str, request: TTestRequest) -> Result<QueryHandle> {
        self.manager.submit(federation_id, QueryParameters::TTest(request))
    }

    pub fn chi_square(&self, federation_id: &str, request: ChiSquareRequest) -> Result<QueryHandle> {
        self.manager
            .submit(federation_id, QueryParameters::ChiSquare(request))
    }

    pub fn anova(&self, federation_id: &str, request: AnovaRequest) -> Result<QueryHandle> {
        self.manager.submit(federation_id, QueryParameters::Anova(request))
    }

    pub fn list_queries(
        &self,
        federation_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryPage> {
        self.manager.list(federation_id, limit, offset)
    }

    pub fn get_query(&self, federation_id: &str, id: QueryId) -> Result<AnalyticsQuery> {
        self.manager.get(federation_id, id)
    }

    pub fn cancel_query(&self, federation_id: &str, id: QueryId) -> Result<AnalyticsQuery> {
        self.manager.cancel(federation_id, id)
    }

    /// Route one request.
    pub async fn handle(&self, method: &str, path: &str, body: Option<&str>) -> ApiResponse {
        let (path, query_string) = path.split_once('?').unwrap_or((path, ""));
        let params = parse_query_string(query_string);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let method = method.to_ascii_uppercase();
        debug!("{} /{}", method, segments.join("/"));

        let (federation_id, route) = match segments.as_slice() {
            ["federations", id, "analytics", rest @ ..] if !id.is_empty() => (*id, rest),
            _ => return not_found(path),
        };

        match (method.as_str(), route) {
            ("POST", ["descriptive"]) => {
                self.submit_route(federation_id, body, &params, |f, r| self.descriptive(f, r))
                    .await
            }
            ("POST", ["ttest"]) => {
                self.submit_route(federation_id, body, &params, |f, r| self.t_test(f, r))
                    .await
            }
            ("POST", ["chisquare"]) => {
                self.submit_route(federation_id, body, &params, |f, r| self.chi_square(f, r))
                    .await
            }
            ("POST", ["anova"]) => {
                self.submit_route(federation_id, body, &params, |f, r| self.anova(f, r))
                    .await
            }
            ("GET", ["queries"]) => {
                let page = parse_usize(&params, "limit").and_then(|limit| {
                    let offset = parse_usize(&params, "offset")?;
                    self.list_queries(federation_id, limit, offset)
                });
                respond(page, 200)
            }
            ("GET", ["queries", id]) => {
                respond(parse_id(id).and_then(|id| self.get_query(federation_id, id)), 200)
            }
            ("POST", ["queries", id, "cancel"]) => {
                respond(parse_id(id).and_then(|id| self.cancel_query(federation_id, id)), 200)
            }
            (_, ["descriptive" | "ttest" | "chisquare" | "anova"])
            | (_, ["queries"])
            | (_, ["queries", _])
            | (_, ["queries", _, "cancel"]) => ApiResponse::plain(
                405,
                "methodNotAllowed",
                format!("{} is not allowed on {}", method, path),
            ),
            _ => not_found(path),
        }
    }

    async fn submit_route<R, F>(
        &self,
        federation_id: &str,
        body: Option<&str>,
        params: &HashMap<String, String>,
        submit: F,
    ) -> ApiResponse
    where
        R: DeserializeOwned,
        F: FnOnce(&str, R) -> Result<QueryHandle>,
    {
        let request: R = match parse_body(body) {
            Ok(request) => request,
            Err(e) => return ApiResponse::error(&e),
        };
        let handle = match submit(federation_id, request) {
            Ok(handle) => handle,
            Err(e) => return ApiResponse::error(&e),
        };

        if params.get("wait").map(|v| v == "true").unwrap_or(false) {
            return match self.manager.wait(handle.query_id).await {
                Ok(query) => {
                    let status = match (&query.status, &query.error) {
                        (QueryStatus::Failed, Some(error)) => error.kind.http_status(),
                        _ => 200,
                    };
                    ApiResponse::ok(status, &query)
                }
                Err(e) => ApiResponse::error(&e),
            };
        }
        ApiResponse::ok(202, &handle)
    }
}

fn respond<T: Serialize>(result: Result<T>, status: u16) -> ApiResponse {
    match result {
        Ok(value) => ApiResponse::ok(status, &value),
        Err(e) => ApiResponse::error(&e),
    }
}

fn not_found(path: &str) -> ApiResponse {
    ApiResponse::plain(404, "notFound", format!("No route for {}", path))
}

fn parse_body<R: DeserializeOwned>(body: Option<&str>) -> Result<R> {
    let body = body.unwrap_or("").trim();
    if body.is_empty() {
        return Err(AnalyticsError::validation("Request body is required"));
    }
    serde_json::from_str(body)
        .map_err(|e| AnalyticsError::validation(format!("Malformed request body: {}", e)))
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.to_string(), value.to_string())
        })
        .collect()
}

fn parse_usize(params: &HashMap<String, String>, name: &str) -> Result<Option<usize>> {
    params
        .get(name)
        .map(|raw| {
            raw.parse::<usize>().map_err(|_| {
                AnalyticsError::validation(format!("{} must be a non-negative integer", name))
            })
        })
        .transpose()
}

fn parse_id(raw: &str) -> Result<QueryId> {
    Uuid::parse_str(raw).map_err(|_| AnalyticsError::not_found(format!("Query {} not found", raw)))
}
