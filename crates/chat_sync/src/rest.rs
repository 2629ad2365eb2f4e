use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use shared::{
    domain::UserId,
    error::PlatformError,
    protocol::{ChatMessage, NewMessage, Profile, ReadMarkUpdate},
};

use crate::{session::Identity, ChatBackend};

const PROFILE_COLUMNS: &str = "id,full_name,avatar_url,push_token";

/// Turns a non-2xx response into a [`PlatformError`].
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PlatformError::from_body(status.as_u16(), &body).into())
}

/// `messages` / `profiles` access through the platform's REST data API.
pub struct RestChatBackend {
    http: Client,
    base_url: String,
    anon_key: String,
}

impl RestChatBackend {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, anon_key)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
        }
    }

    fn table(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder, identity: &Identity) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(&identity.access_token)
    }
}

#[async_trait]
impl ChatBackend for RestChatBackend {
    async fn fetch_messages(&self, identity: &Identity) -> Result<Vec<ChatMessage>> {
        let user_id = identity.user_id;
        let participant_filter = format!("(sender_id.eq.{user_id},recipient_id.eq.{user_id})");
        let response = self
            .authed(self.http.get(self.table("messages")), identity)
            .query(&[
                ("select", "*"),
                ("or", participant_filter.as_str()),
                ("order", "created_at.desc"),
            ])
            .send()
            .await
            .context("messages query failed")?;
        let messages = check_status(response)
            .await?
            .json()
            .await
            .context("invalid messages payload")?;
        Ok(messages)
    }

    async fn fetch_profiles(&self, identity: &Identity, ids: &[UserId]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let id_filter = format!("in.({id_list})");
        let response = self
            .authed(self.http.get(self.table("profiles")), identity)
            .query(&[("select", PROFILE_COLUMNS), ("id", id_filter.as_str())])
            .send()
            .await
            .context("profiles query failed")?;
        let profiles = check_status(response)
            .await?
            .json()
            .await
            .context("invalid profiles payload")?;
        Ok(profiles)
    }

    async fn mark_read(&self, identity: &Identity, counterpart: UserId) -> Result<()> {
        let sender_filter = format!("eq.{counterpart}");
        let recipient_filter = format!("eq.{}", identity.user_id);
        let response = self
            .authed(self.http.patch(self.table("messages")), identity)
            .header("Prefer", "return=minimal")
            .query(&[
                ("sender_id", sender_filter.as_str()),
                ("recipient_id", recipient_filter.as_str()),
                ("read", "eq.false"),
            ])
            .json(&ReadMarkUpdate { read: true })
            .send()
            .await
            .context("mark read request failed")?;
        check_status(response).await?;
        Ok(())
    }

    async fn insert_message(&self, identity: &Identity, message: NewMessage) -> Result<ChatMessage> {
        let response = self
            .authed(self.http.post(self.table("messages")), identity)
            .header("Prefer", "return=representation")
            .json(&message)
            .send()
            .await
            .context("message insert failed")?;
        let mut rows: Vec<ChatMessage> = check_status(response)
            .await?
            .json()
            .await
            .context("invalid inserted message payload")?;
        if rows.is_empty() {
            return Err(anyhow!("message insert returned no row"));
        }
        Ok(rows.swap_remove(0))
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
