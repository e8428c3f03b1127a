use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error};

use testfleet_core::{
    FleetError, FleetResult, PullRequest, ReportRequest, TaskSetPayload, TaskSource, WorkerIdentity,
};

/// 通过 HTTP 向调度服务拉取批次、回报结果
pub struct DispatcherClient {
    dispatcher_url: String,
    http_client: reqwest::Client,
}

impl DispatcherClient {
    pub fn new(dispatcher_url: impl Into<String>) -> FleetResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FleetError::Network(format!("无法创建HTTP客户端: {e}")))?;
        Ok(Self {
            dispatcher_url: dispatcher_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn dispatcher_url(&self) -> &str {
        &self.dispatcher_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.dispatcher_url, path)
    }
}

#[async_trait]
impl TaskSource for DispatcherClient {
    async fn next_task_set(&self, worker: &WorkerIdentity) -> FleetResult<Option<TaskSetPayload>> {
        let request = PullRequest {
            worker_group: worker.group.clone(),
            worker_id: worker.id,
        };
        let response = self
            .http_client
            .post(self.url("/api/workers/next"))
            .json(&request)
            .send()
            .await
            .map_err(|e| FleetError::Network(format!("连接调度服务失败: {e}")))?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                debug!("调度服务没有可运行的批次");
                Ok(None)
            }
            status if status.is_success() => {
                let payload = response
                    .json::<TaskSetPayload>()
                    .await
                    .map_err(|e| FleetError::Serialization(format!("解析批次失败: {e}")))?;
                Ok(Some(payload))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!("拉取批次失败: HTTP {} - {}", status, body);
                Err(FleetError::Network(format!("拉取批次失败: HTTP {status} - {body}")))
            }
        }
    }

    async fn report(&self, report: ReportRequest) -> FleetResult<()> {
        let response = self
            .http_client
            .post(self.url("/api/workers/report"))
            .json(&report)
            .send()
            .await
            .map_err(|e| FleetError::Network(format!("连接调度服务失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!("批次 {}/{} 结果已回报", report.job_id, report.task_set_id);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        error!("回报结果失败: HTTP {} - {}", status, body);
        Err(FleetError::Network(format!("回报结果失败: HTTP {status} - {body}")))
    }
}
