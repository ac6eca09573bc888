//! Request handlers: thin translators between JSON requests and controller
//! operations.
//!
//! Every streaming endpoint follows the same shape: validate the cheap
//! preconditions synchronously (bad input never opens a stream), then spawn
//! a worker task bound to a fresh controller interface and a fresh progress
//! context, and hand the receiving end of the context to the response. The
//! worker commits on success; on any error it leaves the transaction
//! uncommitted and emits a final `{error}` event.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::error;

use stevedore_core::{Context, Error, Result};
use stevedore_engine::{PluginApiRequest, UploadedFiles};
use stevedore_runtime::Controller;

use crate::stream::{StreamFormat, stream_response};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

/// A single non-streaming `{"error": ...}` document.
fn error_json(err: &Error) -> Response {
    let status = match err {
        Error::InvalidInput(_) | Error::InvalidDefinition(_) => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// Checks the bearer token against the stored auth key. A store without a
/// key (not yet initialized) accepts everything.
fn check_auth(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let key = match state.controller.auth_key() {
        Ok(key) => key,
        Err(err) => return Err(error_json(&err)),
    };
    let Some(key) = key else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value));
    if presented == Some(key.as_str()) {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authorization failed."})),
    )
        .into_response())
}

/// Spawns the worker driving `op` and streams its context.
fn spawn_streaming<F, Fut>(state: &AppState, format: StreamFormat, op: F) -> Response
where
    F: FnOnce(Arc<Controller>, Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (ctx, rx) = Context::channel(256);
    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move {
        match op(controller, ctx.clone()).await {
            Ok(()) => ctx.done().await,
            Err(err) => {
                error!(error = %err, "worker failed");
                ctx.fatal(err.to_string()).await;
            }
        }
    });
    stream_response(rx, format)
}

// ─── /list ────────────────────────────────────────────────────────────────────

pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }
    let cintf = match state.controller.interface(Context::null()) {
        Ok(cintf) => cintf,
        Err(err) => return error_json(&err),
    };

    let mut out = Map::new();
    for (deploy_id, deployment) in &cintf.state().deployments {
        let mut services = Map::new();
        for (name, service) in &deployment.services {
            let instances: Vec<String> =
                service.instances.iter().map(|i| i.id.clone()).collect();
            services.insert(
                name.clone(),
                json!({"versions": service.versions().len(), "instances": instances}),
            );
        }
        out.insert(deploy_id.clone(), Value::Object(services));
    }
    Json(Value::Object(out)).into_response()
}

// ─── /create ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRequest {
    pub deploy_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }
    // Duplicate create is invalid input; answer without opening a stream.
    match state.controller.interface(Context::null()) {
        Ok(cintf) => {
            if cintf.state().deployments.contains_key(&body.deploy_id) {
                return error_json(&Error::invalid_input(format!(
                    "deployment {} already exists",
                    body.deploy_id
                )));
            }
        }
        Err(err) => return error_json(&err),
    }

    spawn_streaming(&state, StreamFormat::Json, move |controller, ctx| async move {
        let mut cintf = controller.interface(ctx.clone())?;
        cintf.create_deployment(&body.deploy_id, true).await?;
        cintf.commit()?;
        ctx.job(format!("Created deployment {}", body.deploy_id)).await;
        Ok(())
    })
}

// ─── /setup ───────────────────────────────────────────────────────────────────

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Deserialize)]
pub struct SetupRequest {
    pub deploy_id: String,
    /// Service name to raw definition; iteration order is request order.
    #[serde(default)]
    pub services: Map<String, Value>,
    #[serde(default = "empty_object")]
    pub globals: Value,
    #[serde(default)]
    pub force: bool,
}

pub async fn setup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SetupRequest>,
) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }
    match state.controller.interface(Context::null()) {
        Ok(cintf) => {
            if !cintf.state().deployments.contains_key(&body.deploy_id) {
                return error_json(&Error::invalid_input(format!(
                    "no such deployment, create first: {}",
                    body.deploy_id
                )));
            }
        }
        Err(err) => return error_json(&err),
    }

    spawn_streaming(&state, StreamFormat::Json, move |controller, ctx| async move {
        let mut cintf = controller.interface(ctx)?;
        let changed = cintf.set_globals(&body.deploy_id, body.globals).await?;
        cintf.commit()?;

        // Services are deployed in request order; each one commits on its
        // own, so a failure mid-way leaves earlier services applied.
        let force = body.force || changed;
        for (name, definition) in &body.services {
            cintf.set_service(&body.deploy_id, name, definition, force).await?;
            cintf.commit()?;
        }
        Ok(())
    })
}

// ─── /upload ──────────────────────────────────────────────────────────────────

pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }

    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => return error_json(&Error::from(err)),
    };
    let mut deploy_id = None;
    let mut service_name = None;
    let mut info = empty_object();
    let mut files = UploadedFiles::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return error_json(&Error::invalid_input(err.to_string())),
        };
        let name = field.name().unwrap_or_default().to_string();
        let result: Result<()> = async {
            match name.as_str() {
                "deploy_id" => {
                    deploy_id = Some(text_field(field).await?);
                }
                "service_name" => {
                    service_name = Some(text_field(field).await?);
                }
                "data" => {
                    info = serde_json::from_str(&text_field(field).await?)?;
                }
                _ => {
                    let bytes = bytes_field(field).await?;
                    let path = dir.path().join(&name);
                    tokio::fs::write(&path, &bytes).await?;
                    files.insert(name.clone(), path);
                }
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            return error_json(&err);
        }
    }

    let (Some(deploy_id), Some(service_name)) = (deploy_id, service_name) else {
        return error_json(&Error::invalid_input(
            "upload needs deploy_id and service_name",
        ));
    };

    spawn_streaming(&state, StreamFormat::Json, move |controller, ctx| async move {
        // Keep the uploaded files alive for the duration of the operation.
        let _dir = dir;
        let mut cintf = controller.interface(ctx)?;
        cintf
            .provide_data(&deploy_id, &service_name, &files, &info)
            .await?;
        cintf.commit()?;
        Ok(())
    })
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|err| Error::invalid_input(err.to_string()))
}

async fn bytes_field(field: axum::extract::multipart::Field<'_>) -> Result<Bytes> {
    field
        .bytes()
        .await
        .map_err(|err| Error::invalid_input(err.to_string()))
}

// ─── /{plugin}/{func} ─────────────────────────────────────────────────────────

pub async fn plugin_api(
    State(state): State<AppState>,
    Path((plugin, func)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    request: Request,
) -> Response {
    let public = match state.controller.interface(Context::null()) {
        Ok(cintf) => cintf.plugin_api_is_public(&plugin, &func),
        Err(err) => return error_json(&err),
    };
    if !public && let Err(response) = check_auth(&state, request.headers()) {
        return response;
    }

    // Human consumers (the git push hook) get the plaintext rendering.
    let format = if request
        .headers()
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("text/plain"))
    {
        StreamFormat::Text
    } else {
        StreamFormat::Json
    };

    let mut params = Map::new();
    for (key, value) in query {
        params.insert(key, json!(value));
    }

    // The body is either JSON parameters or a multipart envelope with
    // files; both merge into the same parameter map.
    let mut files = UploadedFiles::new();
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => return error_json(&Error::from(err)),
    };
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));
    if is_multipart {
        let mut multipart = match Multipart::from_request(request, &state).await {
            Ok(multipart) => multipart,
            Err(err) => return error_json(&Error::invalid_input(err.to_string())),
        };
        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(err) => return error_json(&Error::invalid_input(err.to_string())),
            };
            let name = field.name().unwrap_or_default().to_string();
            if field.file_name().is_some() {
                let bytes = match bytes_field(field).await {
                    Ok(bytes) => bytes,
                    Err(err) => return error_json(&err),
                };
                let path = dir.path().join(&name);
                if let Err(err) = tokio::fs::write(&path, &bytes).await {
                    return error_json(&Error::from(err));
                }
                files.insert(name, path);
            } else {
                match text_field(field).await {
                    Ok(text) => {
                        params.insert(name, json!(text));
                    }
                    Err(err) => return error_json(&err),
                }
            }
        }
    } else {
        let bytes = match axum::body::to_bytes(request.into_body(), 2 * 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => return error_json(&Error::invalid_input(err.to_string())),
        };
        if !bytes.is_empty() {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(body)) => params.extend(body),
                Ok(_) => {
                    return error_json(&Error::invalid_input("expected a JSON object body"));
                }
                Err(err) => return error_json(&Error::from(err)),
            }
        }
    }

    let api_request = PluginApiRequest {
        params: Value::Object(params),
        files,
    };
    spawn_streaming(&state, format, move |controller, ctx| async move {
        let _dir = dir;
        let ctx2 = ctx.clone();
        let mut cintf = controller.interface(ctx)?;
        let response = cintf.run_api(&plugin, &func, &api_request).await?;
        match response {
            None => {
                return Err(Error::invalid_input(format!(
                    "no such endpoint: {plugin}/{func}"
                )));
            }
            Some(Value::Null) => {}
            Some(Value::Object(fields)) => ctx2.custom(fields).await,
            Some(other) => {
                let mut fields = Map::new();
                fields.insert("result".to_string(), other);
                ctx2.custom(fields).await;
            }
        }
        cintf.commit()?;
        Ok(())
    })
}
