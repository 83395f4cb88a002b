//! `/containers` and `/handles`: create, fetch, mutate and commit
//! containers through handles.

use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info};

use crate::api::PortLayer;
use crate::api::error::ApiResult;
use crate::error::{Error, Result};
use crate::exec::config::{CreateConfig, generate_attach_key};
use crate::exec::container::ContainerState;
use crate::exec::handle::TargetState;
use crate::exec::network::Endpoint;
use crate::storage::DatastoreUrl;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    pub handle: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandleResponse {
    pub handle: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateChange {
    /// `RUNNING` or `STOPPED`.
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub scope: String,
    /// Static address; the next free one when absent.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointResponse {
    pub handle: String,
    pub endpoint: Endpoint,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub id: String,
    pub state: ContainerState,
}

/// Disk of the image a new container descends from.
async fn resolve_image(pl: &PortLayer, create: &CreateConfig) -> Result<Option<DatastoreUrl>> {
    let Some(id) = &create.image else {
        return Ok(None);
    };
    let store = create
        .image_store
        .as_deref()
        .ok_or_else(|| Error::InvalidArgument("image given without an image store".into()))?;
    let op = pl.op("resolve_image");
    let store = pl.images.get_image_store(&op, store).await?;
    Ok(Some(pl.images.get_image(&op, &store, id).await?.disk))
}

pub async fn create(
    State(pl): State<Arc<PortLayer>>,
    Json(create): Json<CreateConfig>,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    if create.path.is_empty() {
        return Err(Error::InvalidArgument("path is required".into()).into());
    }
    let image = resolve_image(&pl, &create).await?;
    let key = tokio::task::spawn_blocking(generate_attach_key)
        .await
        .map_err(|e| Error::io("generate attach key", std::io::Error::other(e)))??;

    let handle = pl.registry.new_container(&create, key, image);
    let id = handle.container().id().to_owned();
    info!(container = %id, handle = %handle, "container created");
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            id,
            handle: handle.key().to_owned(),
        }),
    ))
}

pub async fn list(State(pl): State<Arc<PortLayer>>) -> Json<Vec<String>> {
    Json(pl.registry.container_ids())
}

pub async fn get(State(pl): State<Arc<PortLayer>>, Path(id): Path<String>) -> ApiResult<Json<HandleResponse>> {
    let handle = pl
        .registry
        .get_container(&id)
        .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
    Ok(Json(HandleResponse {
        handle: handle.key().to_owned(),
    }))
}

/// Committed state, for observability.
pub async fn state(State(pl): State<Arc<PortLayer>>, Path(id): Path<String>) -> ApiResult<Json<StateResponse>> {
    let container = pl
        .registry
        .container(&id)
        .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
    Ok(Json(StateResponse {
        state: container.state(),
        id,
    }))
}

pub async fn state_change(
    State(pl): State<Arc<PortLayer>>,
    Path(key): Path<String>,
    Json(change): Json<StateChange>,
) -> ApiResult<Json<HandleResponse>> {
    let target: TargetState = change.state.parse()?;
    pl.registry.update_handle(&key, |handle| {
        handle.set_state(target);
        Ok(())
    })?;
    Ok(Json(HandleResponse { handle: key }))
}

/// Reserve an address in a scope for the draft. It is written to the VM at
/// commit, or given back if the draft is evicted or fails to commit.
pub async fn add_endpoint(
    State(pl): State<Arc<PortLayer>>,
    Path(key): Path<String>,
    Json(req): Json<EndpointRequest>,
) -> ApiResult<Json<EndpointResponse>> {
    let endpoint = pl.registry.add_endpoint(&key, &req.scope, req.ip)?;
    info!(handle = %key, scope = %req.scope, ip = %endpoint.ip, "endpoint added");
    Ok(Json(EndpointResponse { handle: key, endpoint }))
}

pub async fn commit(State(pl): State<Arc<PortLayer>>, Path(key): Path<String>) -> ApiResult<StatusCode> {
    let op = pl.op("commit");
    let span = tracing::info_span!("api_commit", op = op.id(), handle = %key);
    pl.registry.commit(&op, &key).instrument(span).await?;
    Ok(StatusCode::NO_CONTENT)
}
