//! Action delivery: performs the external effect, never decides when.
//!
//! Delivery is an ordered list of channels, all attempted even when an
//! earlier one fails; each failure is kept and the outcomes aggregate into
//! one error summary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::AutomationConfig;
use common::{ActionKind, Error, Result, WindowSummary};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a delivery channel needs to describe one action. Also the
/// webhook's JSON body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub action: ActionKind,
    pub reason: String,
    pub manual: bool,
    pub active: bool,
    pub stop_id: String,
    pub stop_name: String,
    pub route_id: String,
    pub triggered_at: DateTime<Utc>,
    pub window: Option<WindowSummary>,
}

/// Seam between the engine and the outside world.
pub trait ActionDelivery: Send + Sync + 'static {
    fn perform<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<()>>;
}

/// One way of delivering an action. Adding a channel is a new variant.
#[derive(Debug, Clone)]
pub enum DeliveryChannel {
    /// HTTP POST of the action context, optional bearer credential.
    Webhook { url: String, token: String },
    /// Local command via `sh -c` with the action context injected as
    /// environment values and a hard timeout.
    Command {
        raise_command: String,
        restore_command: String,
        timeout: Duration,
    },
}

impl DeliveryChannel {
    fn label(&self) -> &'static str {
        match self {
            DeliveryChannel::Webhook { .. } => "webhook",
            DeliveryChannel::Command { .. } => "command",
        }
    }

    async fn deliver(&self, client: &reqwest::Client, ctx: &ActionContext) -> Result<()> {
        match self {
            DeliveryChannel::Webhook { url, token } => {
                let mut req = client.post(url).json(ctx);
                if !token.is_empty() {
                    req = req.bearer_auth(token);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| Error::Delivery(format!("webhook request failed: {}", e)))?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::Delivery(
                        format!("webhook failed ({}) {}", status.as_u16(), body.trim())
                            .trim()
                            .to_string(),
                    ));
                }
                Ok(())
            }
            DeliveryChannel::Command {
                raise_command,
                restore_command,
                timeout,
            } => {
                let command = match ctx.action {
                    ActionKind::Raise => raise_command,
                    ActionKind::Restore => restore_command,
                };
                if command.is_empty() {
                    return Ok(());
                }

                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c")
                    .arg(command)
                    .env("MBTA_AUTOMATION_ACTION", ctx.action.as_str())
                    .env("MBTA_AUTOMATION_REASON", &ctx.reason)
                    .env("MBTA_AUTOMATION_STOP_ID", &ctx.stop_id)
                    .env("MBTA_AUTOMATION_STOP_NAME", &ctx.stop_name)
                    .env("MBTA_AUTOMATION_ROUTE_ID", &ctx.route_id)
                    .kill_on_drop(true);

                match tokio::time::timeout(*timeout, cmd.output()).await {
                    Ok(Ok(output)) => {
                        if output.status.success() {
                            Ok(())
                        } else {
                            let stderr = String::from_utf8_lossy(&output.stderr);
                            Err(Error::Delivery(format!(
                                "command failed ({}): {}",
                                output.status,
                                stderr.trim()
                            )))
                        }
                    }
                    Ok(Err(e)) => Err(Error::Delivery(format!("command spawn failed: {}", e))),
                    Err(_) => Err(Error::Delivery(format!(
                        "command timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            }
        }
    }
}

/// Production delivery: webhook and/or local command, best effort.
pub struct ActionExecutor {
    client: reqwest::Client,
    channels: Vec<DeliveryChannel>,
}

impl ActionExecutor {
    pub fn from_config(cfg: &AutomationConfig) -> Self {
        let mut channels = Vec::new();
        if !cfg.webhook_url.is_empty() {
            channels.push(DeliveryChannel::Webhook {
                url: cfg.webhook_url.clone(),
                token: cfg.webhook_token.clone(),
            });
        }
        if !cfg.raise_command.is_empty() || !cfg.restore_command.is_empty() {
            channels.push(DeliveryChannel::Command {
                raise_command: cfg.raise_command.clone(),
                restore_command: cfg.restore_command.clone(),
                timeout: Duration::from_secs(cfg.command_timeout_secs),
            });
        }
        Self::with_channels(channels)
    }

    pub fn with_channels(channels: Vec<DeliveryChannel>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("failed to build webhook client");
        Self { client, channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl ActionDelivery for ActionExecutor {
    fn perform<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut failures: Vec<String> = Vec::new();

            for channel in &self.channels {
                match channel.deliver(&self.client, ctx).await {
                    Ok(()) => {
                        debug!("{} delivered {}", channel.label(), ctx.action.as_str());
                    }
                    Err(e) => {
                        warn!("{} delivery failed: {}", channel.label(), e);
                        failures.push(format!("{}: {}", channel.label(), e));
                    }
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(Error::Delivery(failures.join("; ")))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ctx(action: ActionKind) -> ActionContext {
        ActionContext {
            action,
            reason: "manual-test".into(),
            manual: true,
            active: false,
            stop_id: "place-orhte".into(),
            stop_name: "Orient Heights".into(),
            route_id: "Blue".into(),
            triggered_at: Utc::now(),
            window: None,
        }
    }

    fn command_channel(raise: &str, restore: &str) -> DeliveryChannel {
        DeliveryChannel::Command {
            raise_command: raise.into(),
            restore_command: restore.into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn no_channels_is_a_successful_noop() {
        let executor = ActionExecutor::with_channels(Vec::new());
        assert!(executor.perform(&make_ctx(ActionKind::Raise)).await.is_ok());
    }

    #[tokio::test]
    async fn context_is_injected_into_the_command_environment() {
        let executor = ActionExecutor::with_channels(vec![command_channel(
            r#"test "$MBTA_AUTOMATION_ACTION" = raise && test "$MBTA_AUTOMATION_STOP_ID" = place-orhte"#,
            "",
        )]);
        assert!(executor.perform(&make_ctx(ActionKind::Raise)).await.is_ok());
    }

    #[tokio::test]
    async fn empty_command_for_the_action_is_skipped() {
        // Only a restore command is configured; a raise has nothing to run.
        let executor = ActionExecutor::with_channels(vec![command_channel("", "true")]);
        assert!(executor.perform(&make_ctx(ActionKind::Raise)).await.is_ok());
        assert!(executor.perform(&make_ctx(ActionKind::Restore)).await.is_ok());
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_stop_the_next() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran");
        let touch = format!("touch {}", marker.display());

        let executor = ActionExecutor::with_channels(vec![
            command_channel("exit 3", ""),
            command_channel(&touch, ""),
        ]);

        let err = executor
            .perform(&make_ctx(ActionKind::Raise))
            .await
            .unwrap_err();

        // The second channel still ran, and the failure names the first.
        assert!(marker.exists());
        assert!(err.to_string().contains("command failed"));
    }

    #[tokio::test]
    async fn both_failures_appear_in_the_aggregate() {
        let executor = ActionExecutor::with_channels(vec![
            command_channel("echo one >&2; exit 1", ""),
            command_channel("echo two >&2; exit 2", ""),
        ]);

        let err = executor
            .perform(&make_ctx(ActionKind::Raise))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("one"));
        assert!(message.contains("two"));
    }

    #[tokio::test]
    async fn slow_command_hits_the_hard_timeout() {
        let executor = ActionExecutor::with_channels(vec![DeliveryChannel::Command {
            raise_command: "sleep 5".into(),
            restore_command: String::new(),
            timeout: Duration::from_millis(200),
        }]);

        let err = executor
            .perform(&make_ctx(ActionKind::Raise))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
