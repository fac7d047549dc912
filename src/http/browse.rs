use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::{path_and_query, route, ApiError, AppState, Routed};
use crate::proxy::{OutboundBody, OutboundRequest, Upload};
use crate::routing::RouteKey;

#[derive(Debug, Deserialize)]
pub struct VolumeQuery {
    #[serde(rename = "volumeID")]
    volume_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: Option<String>,
    #[serde(rename = "volumeID")]
    volume_id: Option<String>,
}

fn volume_of(volume_id: &Option<String>) -> Option<&str> {
    volume_id.as_deref().filter(|v| !v.is_empty())
}

fn required_path(path: Option<String>) -> Result<String, ApiError> {
    path.filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Invalid query parameter: path".to_string()))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let volume = volume_of(&query.volume_id);
    let path = required_path(query.path)?;

    let request = OutboundRequest::new(Method::GET, path_and_query(&uri)).with_headers(&headers);
    if let Routed::Done(response) = route(&state, &headers, &RouteKey::for_volume(volume), &request).await? {
        return Ok(response);
    }

    let files = state.browser.list(volume, &path).await?;
    Ok(Json(files).into_response())
}

pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let volume = volume_of(&query.volume_id);
    let path = required_path(query.path)?;

    let request = OutboundRequest::new(Method::GET, path_and_query(&uri)).with_headers(&headers);
    if let Routed::Done(response) = route(&state, &headers, &RouteKey::for_volume(volume), &request).await? {
        return Ok(response);
    }

    let (name, file) = state.browser.open(volume, &path).await?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}

pub async fn put(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
    headers: HeaderMap,
    uri: Uri,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let volume = volume_of(&query.volume_id);
    let upload = read_upload(&mut multipart).await?;

    let request = OutboundRequest::new(Method::POST, path_and_query(&uri))
        .with_headers(&headers)
        .with_body(OutboundBody::Upload(upload.clone()));
    if let Routed::Done(response) = route(&state, &headers, &RouteKey::for_volume(volume), &request).await? {
        return Ok(response);
    }

    state
        .browser
        .put(volume, &upload.path, &upload.file_name, &upload.content)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn delete(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let volume = volume_of(&query.volume_id);
    let path = required_path(query.path)?;

    let request = OutboundRequest::new(Method::DELETE, path_and_query(&uri)).with_headers(&headers);
    if let Routed::Done(response) = route(&state, &headers, &RouteKey::for_volume(volume), &request).await? {
        return Ok(response);
    }

    state.browser.delete(volume, &path).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Reads the `Path` and `file` fields.  Both are required.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    let invalid = |e: axum::extract::multipart::MultipartError| ApiError::BadRequest(e.to_string());

    let mut path = None;
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("Path") => path = Some(field.text().await.map_err(invalid)?),
            Some("file") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content = field.bytes().await.map_err(invalid)?;
                file = Some((file_name, content));
            }
            _ => {}
        }
    }

    let path = path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Invalid file path".to_string()))?;
    let (file_name, content) =
        file.ok_or_else(|| ApiError::BadRequest("Invalid uploaded file".to_string()))?;
    Ok(Upload {
        path,
        file_name,
        content,
    })
}
