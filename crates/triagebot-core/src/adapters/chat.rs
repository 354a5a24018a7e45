//! Chat adapter contract and Slack Web API implementation, built on the
//! modern Web API (`conversations.list`/`conversations.history`) rather
//! than the deprecated RTM websocket transport.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::model::{ChatUser, Message};

/// Connect, enumerate users, drain direct-message events, send messages.
/// Filters to direct-message channels only; group messages never reach
/// `drain_messages`.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), ChatError>;
    async fn list_users(&self) -> Result<Vec<ChatUser>, ChatError>;
    async fn drain_messages(&self) -> Result<Vec<Message>, ChatError>;
    async fn send_to_channel(&self, channel_id: &str, text: &str);
    async fn send_to_user(&self, user: &ChatUser, text: &str);
}

const SLACK_API_BASE: &str = "https://slack.com/api";

pub struct SlackChat {
    client: reqwest::Client,
    token: String,
    /// `user_id -> dm channel id`, populated lazily as messages/sends happen.
    dm_channels: Mutex<std::collections::HashMap<String, String>>,
    /// `dm channel id -> last-seen message timestamp`, used as the `oldest`
    /// cursor for `conversations.history` polling.
    cursors: Mutex<std::collections::HashMap<String, String>>,
}

impl SlackChat {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            dm_channels: Mutex::new(std::collections::HashMap::new()),
            cursors: Mutex::new(std::collections::HashMap::new()),
        }
    }

    async fn get(&self, method: &str, query: &[(&str, &str)]) -> Result<Value, ChatError> {
        let resp = self
            .client
            .get(format!("{SLACK_API_BASE}/{method}"))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?
            .json::<Value>()
            .await?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = resp.get("error").and_then(Value::as_str).unwrap_or("unknown").to_string();
            return Err(ChatError::Api(err));
        }
        Ok(resp)
    }

    async fn post(&self, method: &str, body: &Value) -> Result<Value, ChatError> {
        let resp = self
            .client
            .post(format!("{SLACK_API_BASE}/{method}"))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?
            .json::<Value>()
            .await?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = resp.get("error").and_then(Value::as_str).unwrap_or("unknown").to_string();
            return Err(ChatError::Api(err));
        }
        Ok(resp)
    }

    async fn dm_channel_for(&self, user_id: &str) -> Result<String, ChatError> {
        if let Some(channel) = self.dm_channels.lock().await.get(user_id).cloned() {
            return Ok(channel);
        }
        let resp = self.post("conversations.open", &serde_json::json!({ "users": user_id })).await?;
        let channel = resp["channel"]["id"]
            .as_str()
            .ok_or_else(|| ChatError::Api("conversations.open missing channel id".into()))?
            .to_string();
        self.dm_channels.lock().await.insert(user_id.to_string(), channel.clone());
        Ok(channel)
    }
}

#[derive(Deserialize)]
struct SlackUser {
    id: String,
    name: String,
    profile: SlackProfile,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Deserialize, Default)]
struct SlackProfile {
    first_name: Option<String>,
    real_name: Option<String>,
}

#[async_trait]
impl ChatAdapter for SlackChat {
    async fn connect(&self) -> Result<(), ChatError> {
        self.get("auth.test", &[]).await?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<ChatUser>, ChatError> {
        let resp = self.get("users.list", &[]).await?;
        let members: Vec<SlackUser> = serde_json::from_value(resp["members"].clone())
            .map_err(|e| ChatError::Api(format!("malformed users.list response: {e}")))?;
        Ok(members
            .into_iter()
            .filter(|u| !u.deleted && !u.is_bot)
            .map(|u| ChatUser {
                id: u.id,
                username: u.name,
                first_name: u.profile.first_name,
                real_name: u.profile.real_name,
            })
            .collect())
    }

    /// Polls each known DM channel's `conversations.history` since its last
    /// cursor. Channels the adapter has never DM'd (no prior `send_to_user`
    /// or inbound message) are discovered through `conversations.list`
    /// filtered to `im` types.
    async fn drain_messages(&self) -> Result<Vec<Message>, ChatError> {
        let resp = self.get("conversations.list", &[("types", "im")]).await?;
        let channels = resp["channels"].as_array().cloned().unwrap_or_default();

        let mut messages = Vec::new();
        for channel in channels {
            let channel_id = match channel["id"].as_str() {
                Some(id) => id.to_string(),
                None => continue,
            };
            let user_id = channel["user"].as_str().unwrap_or_default().to_string();

            let oldest = self.cursors.lock().await.get(&channel_id).cloned();
            let mut query = vec![("channel", channel_id.as_str())];
            if let Some(oldest) = oldest.as_deref() {
                query.push(("oldest", oldest));
            }
            let history = match self.get("conversations.history", &query).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(%channel_id, error = %e, "failed to poll conversation history");
                    continue;
                }
            };

            let mut latest_ts: Option<String> = None;
            for msg in history["messages"].as_array().cloned().unwrap_or_default() {
                if msg.get("bot_id").is_some() {
                    continue;
                }
                let text = msg["text"].as_str().unwrap_or_default().to_string();
                let ts = msg["ts"].as_str().unwrap_or_default().to_string();
                if ts.is_empty() {
                    continue;
                }
                let timestamp = parse_slack_ts(&ts);
                if latest_ts.as_deref().map(|l| ts.as_str() > l).unwrap_or(true) {
                    latest_ts = Some(ts);
                }
                messages.push(Message { user_id: user_id.clone(), text, timestamp });
            }

            if let Some(ts) = latest_ts {
                self.cursors.lock().await.insert(channel_id.clone(), ts);
            }
            self.dm_channels.lock().await.insert(user_id, channel_id);
        }

        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn send_to_channel(&self, channel_id: &str, text: &str) {
        let body = serde_json::json!({ "channel": channel_id, "text": text });
        if let Err(e) = self.post("chat.postMessage", &body).await {
            warn!(%channel_id, error = %e, "failed to send chat message");
        } else {
            debug!(%channel_id, "sent chat message");
        }
    }

    async fn send_to_user(&self, user: &ChatUser, text: &str) {
        let channel = match self.dm_channel_for(&user.id).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "could not open DM channel");
                return;
            }
        };
        self.send_to_channel(&channel, text).await;
    }
}

fn parse_slack_ts(ts: &str) -> DateTime<Utc> {
    ts.split('.')
        .next()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slack_timestamp() {
        let ts = parse_slack_ts("1700000000.000100");
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn malformed_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let ts = parse_slack_ts("not-a-timestamp");
        assert!(ts >= before);
    }
}
