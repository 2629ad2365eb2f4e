use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tracing::info;

use crate::{rest::check_status, session::AuthSession, AuthProvider};

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: UserId,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    expires_at: Option<i64>,
    user: TokenUser,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> AuthSession {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| now + Duration::seconds(self.expires_in));
        AuthSession {
            user_id: self.user.id,
            email: self.user.email,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Client for the platform's auth service.
pub struct PlatformAuthClient {
    http: Client,
    base_url: String,
    anon_key: String,
}

impl PlatformAuthClient {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
        }
    }

    async fn token_grant<B: Serialize + Sync>(&self, grant_type: &str, body: &B) -> Result<AuthSession> {
        let response = self
            .http
            .post(format!("{}/auth/v1/token", self.base_url))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("auth {grant_type} request failed"))?;
        let token: TokenResponse = check_status(response)
            .await?
            .json()
            .await
            .context("invalid auth token payload")?;
        Ok(token.into_session(Utc::now()))
    }
}

#[async_trait]
impl AuthProvider for PlatformAuthClient {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession> {
        let session = self
            .token_grant("password", &PasswordGrant { email, password })
            .await?;
        info!(user_id = %session.user_id, "auth: signed in");
        Ok(session)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession> {
        self.token_grant("refresh_token", &RefreshGrant { refresh_token })
            .await
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/auth/v1/logout", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await
            .context("auth logout request failed")?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
