//! `/storage`: image stores and the images in them.
//!
//! Layer uploads stream the request body through a [`pipe`] into the
//! store's blocking archive extraction, so the body is never buffered
//! whole.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::PortLayer;
use crate::api::error::ApiResult;
use crate::error::Error;
use crate::pipe::{PipeWriter, pipe};
use crate::storage::{Image, Metadata};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateStore {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Comma separated image ids.
    pub ids: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteQuery {
    /// `sha256:<hex>` of the archive.
    pub sum: Option<String>,
    #[serde(rename = "metadatakey")]
    pub metadata_key: Option<String>,
    #[serde(rename = "metadataval")]
    pub metadata_val: Option<String>,
}

/// An image as returned over HTTP; metadata values are lossy UTF-8.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageView {
    pub id: String,
    pub store: String,
    pub parent: Option<String>,
    pub self_link: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<Image> for ImageView {
    fn from(image: Image) -> Self {
        Self {
            metadata: image
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect(),
            id: image.id,
            store: image.store.to_string(),
            parent: image.parent,
            self_link: image.self_link.to_string(),
        }
    }
}

pub async fn create_store(
    State(pl): State<Arc<PortLayer>>,
    Json(req): Json<CreateStore>,
) -> ApiResult<(StatusCode, Json<StoreResponse>)> {
    let op = pl.op("create_image_store");
    let url = pl.images.create_image_store(&op, &req.name).await?;
    info!(store = %url, "image store created");
    Ok((StatusCode::CREATED, Json(StoreResponse { url: url.to_string() })))
}

pub async fn list_stores(State(pl): State<Arc<PortLayer>>) -> ApiResult<Json<Vec<String>>> {
    let op = pl.op("list_image_stores");
    let stores = pl.images.list_image_stores(&op).await?;
    Ok(Json(stores.iter().map(ToString::to_string).collect()))
}

pub async fn list_images(
    State(pl): State<Arc<PortLayer>>,
    Path(store): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ImageView>>> {
    let op = pl.op("list_images");
    let store = pl.images.get_image_store(&op, &store).await?;
    let ids: Option<Vec<String>> = query.ids.map(|ids| {
        ids.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect()
    });
    let images = pl.images.list_images(&op, &store, ids.as_deref()).await?;
    Ok(Json(images.into_iter().map(ImageView::from).collect()))
}

pub async fn get_image(
    State(pl): State<Arc<PortLayer>>,
    Path((store, id)): Path<(String, String)>,
) -> ApiResult<Json<ImageView>> {
    let op = pl.op("get_image");
    let store = pl.images.get_image_store(&op, &store).await?;
    let image = pl.images.get_image(&op, &store, &id).await?;
    Ok(Json(image.into()))
}

/// Copy the request body into `writer` until it ends or fails.
async fn pump(body: Body, mut writer: PipeWriter) {
    let mut stream = body.into_data_stream();
    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                total += bytes.len();
                if writer.write_all(&bytes).is_err() {
                    // reader gone, the write already failed
                    return;
                }
            }
            Err(e) => {
                writer.abort(format!("upload interrupted: {e}"));
                return;
            }
        }
    }
    debug!(bytes = total, "upload body consumed");
}

pub async fn write_image(
    State(pl): State<Arc<PortLayer>>,
    Path((store, parent, id)): Path<(String, String, String)>,
    Query(query): Query<WriteQuery>,
    body: Body,
) -> ApiResult<(StatusCode, Json<ImageView>)> {
    let mut metadata = Metadata::new();
    match (query.metadata_key, query.metadata_val) {
        (Some(key), Some(val)) => {
            metadata.insert(key, val.into_bytes());
        }
        (None, None) => {}
        _ => {
            return Err(Error::InvalidArgument("metadatakey and metadataval go together".into()).into());
        }
    }

    let op = pl.op("write_image");
    let store = pl.images.get_image_store(&op, &store).await?;
    let parent = pl.images.get_image(&op, &store, &parent).await?;

    let (writer, reader) = pipe(pl.pipe_close_timeout);
    let pumping = tokio::spawn(pump(body, writer));
    let written = pl
        .images
        .write_image(&op, &parent, &id, metadata, query.sum.as_deref(), Box::new(reader))
        .await;
    pumping.abort();

    let image = written?;
    info!(op = op.id(), image = %image.self_link, "image written");
    Ok((StatusCode::CREATED, Json(image.into())))
}
