use crate::server::{
    http::types::{
        ApiError, IdReply, MultiSet, MultiSetReply, ServicesReply, SetReply, ValueGet, ValueSet,
    },
    telemetry::{increment_http_requests, increment_ids_allocated},
};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use segid::{Manager, Store};
use std::sync::Arc;

type Body<T> = Result<Json<T>, JsonRejection>;

/// `POST /v1/id`
pub async fn next_id<S: Store>(
    State(manager): State<Arc<Manager<S>>>,
    body: Body<ValueGet>,
) -> Result<Json<IdReply>, ApiError> {
    increment_http_requests("/v1/id");
    let Json(ValueGet { name }) = body?;

    let id = manager.next_id(&name).await?;
    increment_ids_allocated(1);
    Ok(Json(IdReply { name, id }))
}

/// `POST /v1/id/set`
pub async fn set_id<S: Store>(
    State(manager): State<Arc<Manager<S>>>,
    body: Body<ValueSet>,
) -> Result<Json<SetReply>, ApiError> {
    increment_http_requests("/v1/id/set");
    let Json(request) = body?;
    request.validate()?;

    let current = manager
        .set_service_id(&request.name, request.value, request.force)
        .await?;
    Ok(Json(SetReply {
        name: request.name.trim().to_owned(),
        current,
    }))
}

/// `POST /v1/id/mset`
pub async fn set_multi<S: Store>(
    State(manager): State<Arc<Manager<S>>>,
    body: Body<MultiSet>,
) -> Result<Json<MultiSetReply>, ApiError> {
    increment_http_requests("/v1/id/mset");
    let Json(request) = body?;
    request.validate()?;

    let entries = request
        .values
        .into_iter()
        .map(|entry| (entry.name, entry.value));
    let values = manager.set_multi_services(entries, request.force).await?;

    Ok(Json(MultiSetReply {
        values,
        error: None,
    }))
}

/// `GET /v1/services`
pub async fn list_services<S: Store>(
    State(manager): State<Arc<Manager<S>>>,
) -> Json<ServicesReply> {
    increment_http_requests("/v1/services");
    Json(ServicesReply {
        services: manager.list_services().await,
    })
}
