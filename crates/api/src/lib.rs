//! # Testfleet API
//!
//! 调度服务的 HTTP 接口：
//! - `POST /api/test` 提交测试运行，作业结束后返回纯文本结果
//! - `POST /api/workers/next`、`POST /api/workers/report` 供 Worker 拉取批次和回报结果
//! - `/api/pool/workers` 管理 Worker 池
//! - `GET /api/jobs`、`GET /health` 查询状态

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState, max_request_size_mb: usize) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(DefaultBodyLimit::max(max_request_size_mb * 1024 * 1024))
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
