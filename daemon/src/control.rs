//! Maps control requests onto the monitor handle

use crate::config::{Config, GeneralConfig, Rule};
use crate::error::{Error, Result};
use crate::protocol::{AddRuleParams, Request, Response};
use crate::service::Monitor;
use crate::socket::RequestHandler;
use std::path::PathBuf;
use tracing::info;

pub struct Controller {
    monitor: Monitor,
    general: GeneralConfig,
    config_path: Option<PathBuf>,
}

impl Controller {
    /// `config_path` of `None` makes `save_settings` fail instead of writing.
    pub fn new(monitor: Monitor, general: GeneralConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            monitor,
            general,
            config_path,
        }
    }

    /// Current settings and interval as a config ready to be written.
    pub async fn current_config(&self) -> Result<Config> {
        let settings = self.monitor.settings().await?;
        let status = self.monitor.status().await?;
        let mut general = self.general.clone();
        general.sample_interval_seconds = status.interval_seconds;
        Ok(Config { general, settings })
    }

    async fn add_rule(&self, params: AddRuleParams) -> Result<serde_json::Value> {
        let mut rule = Rule::new(&params.process_name, &params.display_name)?
            .with_executable_path(&params.executable_path);
        if let Some(th) = params.thresholds {
            rule = rule.with_thresholds(th.normalized());
        }
        let id = self.monitor.add_rule(rule).await?;
        Ok(serde_json::json!({ "id": id }))
    }

    async fn save(&self) -> Result<serde_json::Value> {
        let config = self.current_config().await?;
        let path = self.config_path.as_ref().ok_or(Error::NoConfigPath)?;
        config.save(path)?;
        info!("Settings saved to {:?}", path);
        Ok(serde_json::json!({ "path": path }))
    }
}

fn reply(result: Result<serde_json::Value>) -> Response {
    match result {
        Ok(data) => Response::ok(data),
        Err(e) => Response::error(e),
    }
}

fn done(result: Result<impl Sized>) -> Response {
    reply(result.map(|_| serde_json::json!({ "success": true })))
}

#[async_trait::async_trait]
impl RequestHandler for Controller {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::StartMonitoring => reply(
                self.monitor
                    .start()
                    .await
                    .map(|started| serde_json::json!({ "started": started })),
            ),
            Request::StopMonitoring => reply(
                self.monitor
                    .stop()
                    .await
                    .map(|stopped| serde_json::json!({ "stopped": stopped })),
            ),
            Request::GetStatus => match self.monitor.status().await {
                Ok(data) => Response::Status { data },
                Err(e) => Response::error(e),
            },
            Request::GetSettings => match self.monitor.settings().await {
                Ok(data) => Response::Settings { data },
                Err(e) => Response::error(e),
            },
            Request::AddRule { params } => reply(self.add_rule(params).await),
            Request::RemoveRule { params } => done(self.monitor.remove_rule(params.id).await),
            Request::SetRuleEnabled { params } => done(
                self.monitor
                    .set_rule_enabled(params.id, params.enabled)
                    .await,
            ),
            Request::SetRuleThresholds { params } => done(
                self.monitor
                    .set_rule_thresholds(params.id, params.thresholds)
                    .await,
            ),
            Request::SetGlobalThresholds { params } => {
                done(self.monitor.set_global_thresholds(params).await)
            }
            Request::SetInterval { params } => reply(
                self.monitor
                    .set_interval(params.seconds)
                    .await
                    .map(|seconds| serde_json::json!({ "interval_seconds": seconds })),
            ),
            Request::SaveSettings => reply(self.save().await),
        }
    }
}
