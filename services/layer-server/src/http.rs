//! HTTP routes for serving layers

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::get;
use serde_json::json;
use storage::Storage;

use crate::error::{LayerError, LayerResult};

/// Build the router serving layers out of `storage`.
pub fn router(storage: Storage) -> Router {
    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/{*path}", get(get_blob))
        .with_state(storage)
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

/// Serve a layer, either as a redirect or as a byte stream.
///
/// Repository names may contain slashes, so the blob path is split off the
/// end of the request path. `HEAD` requests are routed here too.
async fn get_blob(
    State(storage): State<Storage>,
    Path(path): Path<String>,
    request: Request,
) -> LayerResult<Response> {
    let (name, digest) = path
        .rsplit_once("/blobs/")
        .ok_or_else(|| LayerError::Unsupported(path.clone()))?;

    validate_repository(name)?;
    validate_digest(digest)?;

    let (parts, _) = request.into_parts();
    let response = storage
        .serve(digest, &parts)
        .await
        .map_err(|error| LayerError::from_storage(digest, error))?;

    tracing::debug!(%name, %digest, status = %response.status(), "served layer");
    Ok(response.map(Body::new))
}

/// Validate repository name
fn validate_repository(name: &str) -> LayerResult<()> {
    if name.is_empty() || name.split('/').any(|part| part.is_empty() || part == "..") {
        return Err(LayerError::InvalidRepository(name.to_string()));
    }
    Ok(())
}

/// Validate digest format: `algorithm:hex`
fn validate_digest(digest: &str) -> LayerResult<()> {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return Err(LayerError::InvalidDigest(digest.to_string()));
    };

    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b));
    let encoded_ok = !encoded.is_empty() && encoded.bytes().all(|b| b.is_ascii_hexdigit());

    if !algorithm_ok || !encoded_ok {
        return Err(LayerError::InvalidDigest(digest.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests() {
        assert!(validate_digest("sha256:abcd0123").is_ok());
        assert!(validate_digest("sha256:").is_err());
        assert!(validate_digest(":abcd").is_err());
        assert!(validate_digest("sha256").is_err());
        assert!(validate_digest("sha256:xyz").is_err());
        assert!(validate_digest("SHA256:abcd").is_err());
    }

    #[test]
    fn repositories() {
        assert!(validate_repository("nginx").is_ok());
        assert!(validate_repository("shell/git/htop").is_ok());
        assert!(validate_repository("").is_err());
        assert!(validate_repository("shell//git").is_err());
        assert!(validate_repository("../etc").is_err());
    }

    #[test]
    fn builds_router() {
        let _router = router(storage::MemoryStorage::new().into());
    }
}
