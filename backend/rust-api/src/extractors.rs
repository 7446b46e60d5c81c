use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use validator::Validate;

/// JSON extractor that rejects with a JSON body instead of axum's plain-text
/// rejection, and runs payload validation before the handler sees the value.
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|rejection| {
            let message = format!("Failed to parse JSON request body: {}", rejection);
            tracing::warn!("{}", message);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": message, "status": 400 })),
            )
                .into_response()
        })?;

        value.validate().map_err(|errors| {
            tracing::warn!("Request validation failed: {}", errors);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "message": errors.to_string(), "status": 422 })),
            )
                .into_response()
        })?;

        Ok(ValidatedJson(value))
    }
}
