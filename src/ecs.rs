/// ECS control calls made after the watchdog decides to stop.
use crate::metadata::TaskMetadata;
use async_trait::async_trait;

/// Reason attached to the StopTask call.
pub const STOP_TASK_REASON: &str = "stopped by ecs-task-self-terminator";

#[derive(Debug)]
pub enum EcsError {
    /// Required task metadata was not discovered.
    MissingMetadata { action: &'static str },
    /// The ECS API call failed.
    Api {
        action: &'static str,
        message: String,
    },
}

impl std::fmt::Display for EcsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EcsError::MissingMetadata { action } => {
                write!(f, "ecs meta is not detected, can not {}", action)
            }
            EcsError::Api { action, message } => {
                write!(f, "failed to {}: {}", action, message)
            }
        }
    }
}

impl std::error::Error for EcsError {}

/// The two ECS operations this tool performs.
#[async_trait]
pub trait EcsControl: Send + Sync {
    async fn stop_task(&self, cluster: &str, task_arn: &str, reason: &str) -> Result<(), EcsError>;

    async fn update_desired_count(
        &self,
        cluster: &str,
        service: &str,
        desired_count: i32,
    ) -> Result<(), EcsError>;
}

/// `EcsControl` backed by the AWS SDK and the default credential chain.
#[derive(Debug, Clone)]
pub struct AwsEcsClient {
    client: aws_sdk_ecs::Client,
}

impl AwsEcsClient {
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: aws_sdk_ecs::Client::new(&config),
        }
    }
}

#[async_trait]
impl EcsControl for AwsEcsClient {
    async fn stop_task(&self, cluster: &str, task_arn: &str, reason: &str) -> Result<(), EcsError> {
        self.client
            .stop_task()
            .cluster(cluster)
            .task(task_arn)
            .reason(reason)
            .send()
            .await
            .map_err(|e| EcsError::Api {
                action: "stop task",
                message: aws_sdk_ecs::error::DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    async fn update_desired_count(
        &self,
        cluster: &str,
        service: &str,
        desired_count: i32,
    ) -> Result<(), EcsError> {
        self.client
            .update_service()
            .cluster(cluster)
            .service(service)
            .desired_count(desired_count)
            .send()
            .await
            .map_err(|e| EcsError::Api {
                action: "set desired count to zero",
                message: aws_sdk_ecs::error::DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}

/// What to do to the task once the run is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostProcess {
    pub stop_task: bool,
    pub set_desired_count_to_zero: bool,
}

impl PostProcess {
    /// Stop the task and/or scale its service to zero.
    ///
    /// Stopping without metadata only warns; scaling without metadata is an error.
    pub async fn run(
        &self,
        ecs: &dyn EcsControl,
        meta: Option<&TaskMetadata>,
    ) -> Result<(), EcsError> {
        tracing::debug!(?self, "starting post process");
        if self.stop_task {
            match meta {
                Some(meta) => {
                    tracing::debug!(task_arn = %meta.task_arn, "stopping task");
                    ecs.stop_task(&meta.cluster, &meta.task_arn, STOP_TASK_REASON)
                        .await?;
                    tracing::info!(task_arn = %meta.task_arn, "stopped task");
                }
                None => tracing::warn!("ecs meta is not detected, can not stop task"),
            }
        }
        if self.set_desired_count_to_zero {
            let meta = meta.ok_or(EcsError::MissingMetadata {
                action: "set desired count to zero",
            })?;
            tracing::debug!(service_name = %meta.service_name, "setting desired count to zero");
            ecs.update_desired_count(&meta.cluster, &meta.service_name, 0)
                .await?;
            tracing::info!(service_name = %meta.service_name, "set desired count to zero");
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every call instead of talking to AWS.
    #[derive(Debug, Default)]
    pub struct RecordingEcs {
        pub calls: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl RecordingEcs {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EcsControl for RecordingEcs {
        async fn stop_task(
            &self,
            cluster: &str,
            task_arn: &str,
            reason: &str,
        ) -> Result<(), EcsError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop_task {cluster} {task_arn} {reason}"));
            if self.fail {
                return Err(EcsError::Api {
                    action: "stop task",
                    message: "AccessDeniedException".to_string(),
                });
            }
            Ok(())
        }

        async fn update_desired_count(
            &self,
            cluster: &str,
            service: &str,
            desired_count: i32,
        ) -> Result<(), EcsError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update_service {cluster} {service} {desired_count}"));
            Ok(())
        }
    }
}
