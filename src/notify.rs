//! Notification composer (spec §4.10): turns a processed notice and its
//! [`HandleOutcome`] into human-readable reports and forwards them to Slack.
//! Disabled entirely when `notify.enable_slack` is false, in which case
//! reports are only logged.

use crate::config::NotifyConfig;
use crate::handler::HandleOutcome;
use crate::notice::Notice;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("slack HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("slack API rejected message: {0}")]
    Rejected(String),
}

/// Posts composed reports to Slack's `chat.postMessage` API, or just logs
/// them when Slack is disabled.
#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Channel for a given event-type label (spec §4.10 "per-event-type
    /// channel routing"), falling back to the default alerts channel.
    fn channel_for(&self, event_type_label: &str) -> String {
        self.config
            .slack_event_channels
            .get(event_type_label)
            .cloned()
            .unwrap_or_else(|| self.config.slack_default_channel.clone())
    }

    /// Pre-handler notice report: fired as soon as a notice is classified,
    /// before `handle_notice` runs (spec §4.10 "notice received").
    pub async fn notice_received(&self, notice: &Notice, event_type_label: &str) -> Result<(), NotifyError> {
        let text = format!(
            ":satellite: *{}* notice received (role={}, ivorn={})",
            notice.event_name(),
            notice.core.role.as_str(),
            notice.core.ivorn,
        );
        self.send(&self.channel_for(event_type_label), &text).await
    }

    /// Post-handler observing report: what survey/targets were created or
    /// why nothing was (spec §4.10 "observing plan summary").
    pub async fn observing_report(&self, outcome: &HandleOutcome, event_type_label: &str) -> Result<(), NotifyError> {
        let text = if outcome.targets_created > 0 {
            format!(
                ":telescope: *{}* -> strategy `{}`, survey `{}`: {} target(s) scheduled, {} tombstoned",
                outcome.event_name,
                outcome.strategy_key,
                outcome.survey_name.as_deref().unwrap_or("-"),
                outcome.targets_created,
                outcome.targets_tombstoned,
            )
        } else if outcome.strategy_key == crate::strategy::IGNORE {
            format!(":no_entry_sign: *{}* ignored (strategy IGNORE)", outcome.event_name)
        } else if outcome.strategy_key == crate::strategy::RETRACTION {
            format!(
                ":warning: *{}* retracted, {} target(s) tombstoned",
                outcome.event_name, outcome.targets_tombstoned
            )
        } else {
            format!(
                "*{}* -> strategy `{}`: no update required",
                outcome.event_name, outcome.strategy_key
            )
        };
        self.send(&self.channel_for(event_type_label), &text).await?;

        // Significant events (any event that actually scheduled targets or
        // was retracted) also get forwarded to the wakeup channel, if one is
        // configured, so an on-call human sees it without watching every
        // per-type channel.
        if let Some(wakeup) = &self.config.slack_wakeup_channel {
            if outcome.targets_created > 0 || outcome.strategy_key == crate::strategy::RETRACTION {
                self.send(wakeup, &text).await?;
            }
        }
        Ok(())
    }

    /// Forward an ignored notice's report to the dedicated ignored-channel,
    /// if one is configured, instead of the default channel (spec §4.10).
    pub async fn ignored(&self, notice: &Notice) -> Result<(), NotifyError> {
        let Some(channel) = &self.config.slack_ignored_channel else {
            return Ok(());
        };
        let text = format!(":mute: ignored notice: {}", notice.core.ivorn);
        self.send(channel, &text).await
    }

    /// Heartbeat silence/recovery messages (spec §4.10), routed to the
    /// wakeup channel when configured, else the default channel.
    pub async fn heartbeat_silence(&self, elapsed_secs: i64) -> Result<(), NotifyError> {
        let channel = self
            .config
            .slack_wakeup_channel
            .clone()
            .unwrap_or_else(|| self.config.slack_default_channel.clone());
        let text = format!(":rotating_light: no notices received in {elapsed_secs}s, listener may be stalled");
        self.send(&channel, &text).await
    }

    pub async fn heartbeat_recovery(&self) -> Result<(), NotifyError> {
        let channel = self
            .config
            .slack_wakeup_channel
            .clone()
            .unwrap_or_else(|| self.config.slack_default_channel.clone());
        self.send(&channel, ":white_check_mark: listener recovered").await
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
        if !self.config.enable_slack {
            tracing::info!(channel, text, "notification (slack disabled, logged only)");
            return Ok(());
        }

        let resp = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.config.slack_bot_token)
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .send()
            .await?;

        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let error = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(NotifyError::Rejected(error));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_for_falls_back_to_default() {
        let notifier = Notifier::new(NotifyConfig::default());
        assert_eq!(notifier.channel_for("GW"), "#alerts");
    }

    #[test]
    fn channel_for_honors_event_type_override() {
        let mut config = NotifyConfig::default();
        config.slack_event_channels.insert("GW".to_string(), "#gw-alerts".to_string());
        let notifier = Notifier::new(config);
        assert_eq!(notifier.channel_for("GW"), "#gw-alerts");
        assert_eq!(notifier.channel_for("GRB"), "#alerts");
    }
}
