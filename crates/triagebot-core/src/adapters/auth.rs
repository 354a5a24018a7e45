//! Auth adapter contract and Duo push-2FA implementation: a small state
//! machine (NONE, PENDING, AUTHORIZED, DENIED, with AUTHORIZED decaying
//! after `AUTH_TTL`) layered over Duo's preauth/auth/auth_status calls.
//! Duo's Auth API signs every request with HMAC-SHA1 over a canonical
//! string, hence the `hmac`+`sha1` dependency.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::AuthError;
use crate::model::AuthState;

pub const AUTH_TTL: i64 = 2 * 3600;

/// Per-user 2FA: capability probe, non-blocking challenge, status poll,
/// reset. Implementations own their own per-user auth-time bookkeeping.
#[async_trait]
pub trait AuthAdapter: Send + Sync {
    async fn can_auth(&self, username: &str) -> Result<bool, AuthError>;
    async fn begin(&self, username: &str, reason: Option<&str>) -> Result<(), AuthError>;
    async fn status(&self, username: &str) -> Result<AuthState, AuthError>;
    async fn reset(&self, username: &str);
}

struct SessionState {
    state: AuthState,
    txid: Option<String>,
    auth_time: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self { state: AuthState::None, txid: None, auth_time: None }
    }
}

pub struct DuoAuth {
    client: reqwest::Client,
    api_host: String,
    integration_key: String,
    secret_key: String,
    sessions: Mutex<std::collections::HashMap<String, SessionState>>,
}

impl DuoAuth {
    pub fn new(api_host: String, integration_key: String, secret_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_host,
            integration_key,
            secret_key,
            sessions: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn sign(&self, method: &str, path: &str, params: &str, date: &str) -> String {
        let canonical = format!("{date}\n{method}\n{host}\n{path}\n{params}", host = self.api_host);
        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_header(&self, signature: &str) -> String {
        let token = format!("{}:{}", self.integration_key, signature);
        format!("Basic {}", base64_encode(token.as_bytes()))
    }

    async fn preauth(&self, username: &str) -> Result<serde_json::Value, AuthError> {
        let params = format!("username={username}");
        let date = http_date_now();
        let signature = self.sign("POST", "/auth/v2/preauth", &params, &date);
        let resp = self
            .client
            .post(format!("https://{}/auth/v2/preauth", self.api_host))
            .header("Date", &date)
            .header("Authorization", self.auth_header(&signature))
            .form(&[("username", username)])
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;
        Ok(resp)
    }

    async fn auth_begin(&self, username: &str, pushinfo: &str) -> Result<String, AuthError> {
        let params = format!("async=1&device=auto&factor=push&pushinfo={pushinfo}&username={username}");
        let date = http_date_now();
        let signature = self.sign("POST", "/auth/v2/auth", &params, &date);
        let resp = self
            .client
            .post(format!("https://{}/auth/v2/auth", self.api_host))
            .header("Date", &date)
            .header("Authorization", self.auth_header(&signature))
            .form(&[
                ("username", username),
                ("factor", "push"),
                ("device", "auto"),
                ("async", "1"),
                ("pushinfo", pushinfo),
            ])
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;
        resp["response"]["txid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AuthError::Api("Duo auth response missing txid".into()))
    }

    async fn poll_status(&self, txid: &str) -> Result<(bool, bool), AuthError> {
        let params = format!("txid={txid}");
        let date = http_date_now();
        let signature = self.sign("GET", "/auth/v2/auth_status", &params, &date);
        let resp = self
            .client
            .get(format!("https://{}/auth/v2/auth_status", self.api_host))
            .header("Date", &date)
            .header("Authorization", self.auth_header(&signature))
            .query(&[("txid", txid)])
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;
        let waiting = resp["response"]["waiting"].as_bool().unwrap_or(false);
        let success = resp["response"]["result"].as_str() == Some("allow");
        Ok((waiting, success))
    }
}

#[async_trait]
impl AuthAdapter for DuoAuth {
    async fn can_auth(&self, username: &str) -> Result<bool, AuthError> {
        let res = self.preauth(username).await?;
        if res["response"]["result"].as_str() != Some("auth") {
            return Ok(false);
        }
        Ok(res["response"]["devices"]
            .as_array()
            .map(|devices| {
                devices.iter().any(|d| {
                    d["capabilities"]
                        .as_array()
                        .map(|caps| caps.iter().any(|c| c.as_str() == Some("push")))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false))
    }

    async fn begin(&self, username: &str, reason: Option<&str>) -> Result<(), AuthError> {
        let mut pushinfo = "from=triagebot".to_string();
        if let Some(reason) = reason {
            pushinfo.push('&');
            pushinfo.push_str(&format!("reason={}", urlencoding::encode(reason)));
        }
        let txid = self.auth_begin(username, &pushinfo).await?;
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(username.to_string()).or_default();
        entry.txid = Some(txid);
        entry.state = AuthState::Pending;
        Ok(())
    }

    async fn status(&self, username: &str) -> Result<AuthState, AuthError> {
        let txid = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(username) {
                Some(s) if s.state == AuthState::Pending => s.txid.clone(),
                Some(s) => {
                    if s.state == AuthState::Authorized {
                        let recently_authed = s
                            .auth_time
                            .map(|t| Utc::now() - t < Duration::seconds(AUTH_TTL))
                            .unwrap_or(false);
                        if !recently_authed {
                            drop(sessions);
                            let mut sessions = self.sessions.lock().unwrap();
                            sessions.entry(username.to_string()).or_default().state = AuthState::None;
                            return Ok(AuthState::None);
                        }
                    }
                    return Ok(s.state);
                }
                None => return Ok(AuthState::None),
            }
        };

        let Some(txid) = txid else { return Ok(AuthState::None) };
        let (waiting, success) = self.poll_status(&txid).await?;
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(username.to_string()).or_default();
        if !waiting {
            if success {
                entry.state = AuthState::Authorized;
                entry.auth_time = Some(Utc::now());
            } else {
                entry.state = AuthState::Denied;
                entry.auth_time = None;
            }
        }
        Ok(entry.state)
    }

    async fn reset(&self, username: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(username.to_string(), SessionState::default());
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_same_inputs() {
        let auth = DuoAuth::new("api-host.duosecurity.com".into(), "ikey".into(), "skey".into());
        let a = auth.sign("POST", "/auth/v2/preauth", "username=alice", "Mon, 01 Jan 2024 00:00:00 GMT");
        let b = auth.sign("POST", "/auth/v2/preauth", "username=alice", "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40); // hex-encoded SHA-1 digest
    }

    #[test]
    fn signature_changes_with_params() {
        let auth = DuoAuth::new("api-host.duosecurity.com".into(), "ikey".into(), "skey".into());
        let a = auth.sign("POST", "/auth/v2/preauth", "username=alice", "Mon, 01 Jan 2024 00:00:00 GMT");
        let b = auth.sign("POST", "/auth/v2/preauth", "username=bob", "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_ne!(a, b);
    }
}
