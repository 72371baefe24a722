//! Change digests and their delivery to an external sink.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bountyping_core::{ChangeKind, ChangeSet, ProgramChange};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_MAX_HIGHLIGHTS: usize = 5;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

const COLOR_CREATED: u32 = 0x00ff00;
const COLOR_UPDATED: u32 = 0xffa500;
const DISCORD_MAX_EMBEDS: usize = 10;
const DISCORD_FIELD_LIMIT: usize = 1024;
const DISCORD_TITLE_LIMIT: usize = 256;
const SCOPE_PREVIEW_ASSETS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestHighlight {
    pub kind: ChangeKind,
    pub platform: String,
    pub name: String,
    pub url: String,
    pub bounty: String,
    pub asset_types: Vec<String>,
    pub scope_preview: Option<String>,
    pub changes: Vec<String>,
}

impl DigestHighlight {
    fn from_change(change: &ProgramChange) -> Self {
        let program = &change.after;
        let scope_preview = if program.assets.is_empty() {
            None
        } else {
            let mut preview = program
                .assets
                .iter()
                .take(SCOPE_PREVIEW_ASSETS)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            if program.assets.len() > SCOPE_PREVIEW_ASSETS {
                preview.push_str(&format!(" (+{} more)", program.assets.len() - SCOPE_PREVIEW_ASSETS));
            }
            Some(preview)
        };

        Self {
            kind: change.kind,
            platform: program.platform.clone(),
            name: program.name.clone(),
            url: program.url.clone(),
            bounty: program.bounty_range(),
            asset_types: program.asset_types.iter().cloned().collect(),
            scope_preview,
            changes: change.field_changes().iter().map(ToString::to_string).collect(),
        }
    }
}

/// Structured message handed to a sink: counts plus a bounded highlight list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub platform: String,
    pub created: usize,
    pub updated: usize,
    pub highlights: Vec<DigestHighlight>,
    pub omitted: usize,
}

impl Digest {
    /// `None` for an empty change set. Highlights put new programs first, then
    /// the highest bounty, then the most recently seen.
    pub fn from_changes(platform: &str, changes: &ChangeSet, max_highlights: usize) -> Option<Self> {
        if changes.is_empty() {
            return None;
        }

        let mut ranked = changes.iter().collect::<Vec<_>>();
        ranked.sort_by_key(|c| {
            (
                c.kind != ChangeKind::Created,
                Reverse(c.after.bounty_ceiling()),
                Reverse(c.after.first_seen),
            )
        });

        let highlights = ranked
            .iter()
            .take(max_highlights)
            .map(|c| DigestHighlight::from_change(c))
            .collect::<Vec<_>>();

        Some(Self {
            platform: platform.to_string(),
            created: changes.created_count(),
            updated: changes.updated_count(),
            omitted: changes.len() - highlights.len(),
            highlights,
        })
    }

    pub fn summary(&self) -> String {
        let mut message = format!("**{} Scrape Complete**\n", title_case(&self.platform));
        if self.created > 0 {
            message.push_str(&format!("🆕 {} new program(s)\n", self.created));
        }
        if self.updated > 0 {
            message.push_str(&format!("📝 {} updated program(s)\n", self.updated));
        }
        if self.omitted > 0 {
            message.push_str(&format!("…and {} more not shown", self.omitted));
        }
        message.trim_end().to_string()
    }
}

fn title_case(value: &str) -> String {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Discord rejects embeds whose field values or titles exceed its limits.
fn clip(value: String, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value;
    }
    let mut clipped = value.chars().take(limit - 1).collect::<String>();
    clipped.push('…');
    clipped
}

fn clip_field(value: String) -> String {
    clip(value, DISCORD_FIELD_LIMIT)
}

/// Discord webhook body for a digest: summary content plus one embed per highlight.
pub fn discord_payload(digest: &Digest) -> JsonValue {
    let embeds = digest
        .highlights
        .iter()
        .take(DISCORD_MAX_EMBEDS)
        .map(|h| {
            let (title, color) = match h.kind {
                ChangeKind::Created => (format!("🆕 New Bug Bounty: {}", h.name), COLOR_CREATED),
                ChangeKind::Updated => (format!("📝 Updated: {}", h.name), COLOR_UPDATED),
            };
            let mut fields = vec![
                json!({ "name": "Platform", "value": title_case(&h.platform), "inline": true }),
                json!({ "name": "Bounty", "value": h.bounty, "inline": true }),
            ];
            if !h.asset_types.is_empty() {
                let value = clip_field(h.asset_types.join(", "));
                fields.push(json!({ "name": "Asset Types", "value": value, "inline": false }));
            }
            if let Some(scope) = &h.scope_preview {
                let value = clip_field(format!("`{scope}`"));
                fields.push(json!({ "name": "Scope Preview", "value": value, "inline": false }));
            }
            if !h.changes.is_empty() {
                let value = clip_field(h.changes.join("\n"));
                fields.push(json!({ "name": "Changes", "value": value, "inline": false }));
            }

            let mut embed = json!({
                "title": clip(title, DISCORD_TITLE_LIMIT),
                "color": color,
                "fields": fields,
                "footer": { "text": "BountyPing" },
            });
            if !h.url.is_empty() {
                embed["url"] = JsonValue::String(h.url.clone());
            }
            embed
        })
        .collect::<Vec<_>>();

    json!({ "content": digest.summary(), "embeds": embeds })
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification sink answered {status}")]
    Status { status: u16 },
    #[error("notification send timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, digest: &Digest) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct DiscordWebhookSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordWebhookSink {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building discord webhook client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for DiscordWebhookSink {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, digest: &Digest) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&discord_payload(digest))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NothingToSend,
    NoSink,
    Delivered,
    Failed(String),
}

/// Turns a change set into at most one sink call. Never returns an error:
/// delivery problems are logged and reported in the outcome only.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Option<Arc<dyn NotificationSink>>,
    max_highlights: usize,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(sink: Option<Arc<dyn NotificationSink>>) -> Self {
        Self {
            sink,
            max_highlights: DEFAULT_MAX_HIGHLIGHTS,
            timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn with_max_highlights(mut self, max_highlights: usize) -> Self {
        self.max_highlights = max_highlights;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub async fn dispatch(&self, platform: &str, changes: &ChangeSet) -> DispatchOutcome {
        let Some(digest) = Digest::from_changes(platform, changes, self.max_highlights) else {
            return DispatchOutcome::NothingToSend;
        };
        let Some(sink) = &self.sink else {
            return DispatchOutcome::NoSink;
        };

        let result = match tokio::time::timeout(self.timeout, sink.send(&digest)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                info!(
                    sink = sink.name(),
                    platform,
                    created = digest.created,
                    updated = digest.updated,
                    "notification delivered"
                );
                DispatchOutcome::Delivered
            }
            Err(err) => {
                warn!(sink = sink.name(), platform, error = %err, "notification delivery failed");
                DispatchOutcome::Failed(err.to_string())
            }
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("sink", &self.sink.as_ref().map(|s| s.name().to_string()))
            .field("max_highlights", &self.max_highlights)
            .field("timeout", &self.timeout)
            .finish()
    }
}
