use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::{path_and_query, route, ApiError, AppState, Routed};
use crate::browse::BrowseError;
use crate::proxy::OutboundRequest;
use crate::routing::RouteKey;
use crate::types::Member;

pub async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Member>> {
    Json(state.cluster.members())
}

/// Volumes of every node.  A forwarded call answers with the local list.
pub async fn volumes(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let request = OutboundRequest::new(Method::GET, path_and_query(&uri)).with_headers(&headers);
    match route(&state, &headers, &RouteKey::Broadcast, &request).await? {
        Routed::Done(response) => Ok(response),
        Routed::Local => {
            let volumes = state
                .browser
                .runtime()
                .list_volumes()
                .await
                .map_err(BrowseError::Runtime)?;
            Ok(Json(volumes).into_response())
        }
    }
}
