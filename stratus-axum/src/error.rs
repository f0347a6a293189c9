use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stratus_upload::UploadError;

#[derive(Debug)]
pub struct StratusAxumError(pub anyhow::Error);

impl From<anyhow::Error> for StratusAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<UploadError> for StratusAxumError {
    fn from(e: UploadError) -> Self {
        Self(anyhow::Error::new(e))
    }
}

impl StratusAxumError {
    pub fn status(&self) -> StatusCode {
        match self.0.chain().find_map(|e| e.downcast_ref::<UploadError>()) {
            Some(UploadError::ClassifierFraming { .. }) | Some(UploadError::Cancelled) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StratusAxumError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (name, class_name) = match status {
            StatusCode::BAD_REQUEST => ("BadRequest", "bad-request"),
            _ => ("GeneralError", "general-error"),
        };

        let body = json!({
            "name": name,
            "message": self.0.to_string(),
            "code": status.as_u16(),
            "className": class_name,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_map_to_status_codes() {
        let framing = StratusAxumError::from(UploadError::framing("bad boundary"));
        assert_eq!(framing.status(), StatusCode::BAD_REQUEST);

        let cancelled = StratusAxumError::from(UploadError::Cancelled);
        assert_eq!(cancelled.status(), StatusCode::BAD_REQUEST);

        let asset = StratusAxumError::from(UploadError::asset("db down"));
        assert_eq!(asset.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let wrapped = StratusAxumError::from(anyhow::Error::new(UploadError::framing("x")).context("while uploading"));
        assert_eq!(wrapped.status(), StatusCode::BAD_REQUEST);

        let other = StratusAxumError::from(anyhow::anyhow!("boom"));
        assert_eq!(other.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
