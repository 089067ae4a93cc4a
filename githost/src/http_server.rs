use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tower_http::cors::{Any, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::{Database, Deployment, Repository};
use crate::error::AppError;
use crate::protocol::{RelayMode, Service};
use crate::relay::Relay;
use crate::repos::RepoService;
use crate::store::RepoStore;

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub store: RepoStore,
    pub relay: Relay,
    pub repos: RepoService,
}

/// Query parameters for the ref advertisement
#[derive(Debug, Deserialize)]
pub struct InfoRefsQuery {
    pub service: Option<String>,
}

/// Request body for creating a repository
#[derive(Debug, Deserialize)]
pub struct CreateRepoRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Request body for checking a repository name
#[derive(Debug, Deserialize)]
pub struct CheckNameRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CheckNameResponse {
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct RepositoryList {
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Serialize)]
pub struct DeploymentList {
    pub deployments: Vec<Deployment>,
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route(
            "/repositories",
            get(list_repositories).post(create_repository),
        )
        .route("/repositories/:name/deployments", get(list_deployments))
        .route("/check-name", post(check_name))
        .layer(cors);

    // Git smart HTTP protocol routes; clients may gzip request bodies
    let git_routes = Router::new()
        .route("/:repo/info/refs", get(git_info_refs))
        .route("/:repo/git-upload-pack", post(git_upload_pack))
        .route("/:repo/git-receive-pack", post(git_receive_pack))
        .layer(RequestDecompressionLayer::new());

    Router::new()
        .nest("/api", api_routes)
        .merge(git_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ API Handlers ============

async fn health() -> &'static str {
    "OK"
}

/// List all repositories
async fn list_repositories(State(state): State<AppState>) -> Result<Json<RepositoryList>, AppError> {
    let repositories = state.repos.list_repositories().await?;
    Ok(Json(RepositoryList { repositories }))
}

/// Create a new repository
async fn create_repository(
    State(state): State<AppState>,
    Json(body): Json<CreateRepoRequest>,
) -> Result<(StatusCode, Json<Repository>), AppError> {
    let repo = state
        .repos
        .create_repository(&body.name, &body.description)
        .await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

/// Check whether a repository name can be used
async fn check_name(
    State(state): State<AppState>,
    Json(body): Json<CheckNameRequest>,
) -> Result<Json<CheckNameResponse>, AppError> {
    let available = state.repos.check_name(&body.name).await?;
    Ok(Json(CheckNameResponse {
        name: body.name,
        available,
    }))
}

/// List the deployments of a repository
async fn list_deployments(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeploymentList>, AppError> {
    let repo = state
        .db
        .get_repository_by_name(&name)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Repository '{}' not found", name)))?;
    let deployments = state.db.list_deployments(repo.id).await?;
    Ok(Json(DeploymentList { deployments }))
}

// ============ Git HTTP Smart Protocol Handlers ============

/// Resolve `<name>.git` to an initialized repository path
async fn resolve_repo(state: &AppState, segment: &str) -> Result<PathBuf, StatusCode> {
    let name = segment.strip_suffix(".git").ok_or(StatusCode::NOT_FOUND)?;
    if let Err(e) = state.store.path(name) {
        warn!(repo = segment, "rejected repository name: {}", e);
        return Err(StatusCode::NOT_FOUND);
    }

    state.store.ensure(name).await.map_err(|e| {
        error!(repo = segment, "Failed to prepare repository: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Start the relay and wrap its output in a streaming response
fn relay_response(
    state: &AppState,
    service: Service,
    repo_path: &std::path::Path,
    mode: RelayMode,
    body: Option<Body>,
) -> Result<Response, StatusCode> {
    let input = body.map(|body| {
        StreamReader::new(body.into_data_stream().map_err(io::Error::other))
    });

    let stream = state
        .relay
        .start(service, repo_path, mode, input)
        .map_err(|e| {
            error!(%service, "Failed to start relay: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok((
        [
            (header::CONTENT_TYPE, service.content_type(mode)),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Advertise refs for `git-upload-pack` or `git-receive-pack`
async fn git_info_refs(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, StatusCode> {
    let service: Service = query
        .service
        .as_deref()
        .ok_or(StatusCode::BAD_REQUEST)?
        .parse()
        .map_err(|e| {
            warn!(repo, "{}", e);
            StatusCode::BAD_REQUEST
        })?;

    let repo_path = resolve_repo(&state, &repo).await?;
    info!(repo, %service, "advertising refs");
    relay_response(&state, service, &repo_path, RelayMode::Advertise, None)
}

/// Handle git-upload-pack (for git fetch/clone)
async fn git_upload_pack(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    body: Body,
) -> Result<Response, StatusCode> {
    let repo_path = resolve_repo(&state, &repo).await?;
    relay_response(&state, Service::UploadPack, &repo_path, RelayMode::Rpc, Some(body))
}

/// Handle git-receive-pack (for git push)
async fn git_receive_pack(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    body: Body,
) -> Result<Response, StatusCode> {
    let repo_path = resolve_repo(&state, &repo).await?;
    info!(repo, "receiving push");
    relay_response(&state, Service::ReceivePack, &repo_path, RelayMode::Rpc, Some(body))
}

/// Run the HTTP server
pub async fn run_http_server(
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", state.config.http_port);
    let app = create_router(state);

    info!("HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::test_db;
    use crate::git_ops::tests::git_available;
    use crate::git_ops::SystemGit;
    use crate::store::HookCommand;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn state(dir: &TempDir) -> AppState {
        let store = RepoStore::open(
            &dir.path().join("repos"),
            "main",
            HookCommand {
                program: PathBuf::from("/bin/true"),
                args: Vec::new(),
            },
            Arc::new(SystemGit::new("git")),
        )
        .unwrap();
        let db = test_db(dir).await;
        AppState {
            config: Arc::new(Config::default_config()),
            repos: RepoService::new(db.clone(), store.clone(), "main"),
            db,
            store,
            relay: Relay::new("git"),
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(uri: &str, json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir).await);
        let (status, body) = send(app, get_request("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_unsupported_service_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir).await);

        for uri in [
            "/demo.git/info/refs?service=git-upload-archive",
            "/demo.git/info/refs",
        ] {
            let (status, body) = send(app.clone(), get_request(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.is_empty());
        }
        assert!(!dir.path().join("repos").join("demo.git").exists());
    }

    #[tokio::test]
    async fn test_invalid_repository_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir).await);

        for uri in [
            "/demo/info/refs?service=git-upload-pack",
            "/.git/info/refs?service=git-upload-pack",
            "/.git.git/info/refs?service=git-receive-pack",
            "/bad%20name.git/info/refs?service=git-upload-pack",
        ] {
            let (status, body) = send(app.clone(), get_request(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert!(body.is_empty());
        }
        assert!(!dir.path().join("repos").join(".git").exists());
    }

    #[tokio::test]
    async fn test_info_refs_creates_repository_and_advertises() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir).await);

        let response = app
            .oneshot(get_request("/demo.git/info/refs?service=git-receive-pack"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-git-receive-pack-advertisement"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(b"001f# service=git-receive-pack\n0000"));
        assert!(dir.path().join("repos").join("demo.git").join("HEAD").exists());
    }

    #[tokio::test]
    async fn test_repository_api() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir).await);

        let (status, body) = send(
            app.clone(),
            json_request("/api/repositories", r#"{"name":"demo","description":"A demo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(created["name"], "demo");
        assert_eq!(created["deploy_branch"], "main");

        let (status, body) = send(
            app.clone(),
            json_request("/api/repositories", r#"{"name":"demo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(error["error"].as_str().unwrap().contains("demo"));

        let (status, _) = send(
            app.clone(),
            json_request("/api/repositories", r#"{"name":"../etc"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app.clone(), get_request("/api/repositories")).await;
        assert_eq!(status, StatusCode::OK);
        let list: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(list["repositories"].as_array().unwrap().len(), 1);

        let (_, body) = send(
            app.clone(),
            json_request("/api/check-name", r#"{"name":"demo"}"#),
        )
        .await;
        let check: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(check["available"], false);

        let (status, body) = send(app.clone(), get_request("/api/repositories/demo/deployments")).await;
        assert_eq!(status, StatusCode::OK);
        let deployments: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(deployments["deployments"].as_array().unwrap().is_empty());

        let (status, _) = send(app, get_request("/api/repositories/missing/deployments")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
