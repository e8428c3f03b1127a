use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use testfleet_core::FleetError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度错误: {0}")]
    Fleet(#[from] FleetError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源: {0}")]
    NotFound(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Fleet(FleetError::NoRunnableWork) => (StatusCode::NO_CONTENT, "NO_RUNNABLE_WORK"),
            ApiError::Fleet(e) if e.is_request_error() => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::Fleet(FleetError::JobNotFound { .. }) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
            ApiError::Fleet(FleetError::TaskSetNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "TASK_SET_NOT_FOUND")
            }
            ApiError::Fleet(FleetError::Serialization(_)) => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            ApiError::Fleet(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        // 没有可运行的批次是正常情况，不带响应体
        if status == StatusCode::NO_CONTENT {
            return status.into_response();
        }
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}
