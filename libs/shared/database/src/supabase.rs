use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.clone(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>, return_representation: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key).unwrap());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if return_representation {
            // PostgREST echoes affected rows back, which is how conditional
            // updates learn whether their status filter still matched.
            headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        }

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }

        headers
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let headers = self.get_headers(auth_token, matches!(method, Method::POST | Method::PATCH));

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// Insert one or more rows into a table, returning the stored rows.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: Value,
        auth_token: Option<&str>,
    ) -> Result<Vec<Value>> {
        let path = format!("/rest/v1/{}", table);
        self.request(Method::POST, &path, auth_token, Some(rows)).await
    }

    /// Select rows matching a PostgREST filter string such as
    /// `doctor_user_id=eq.<uuid>&order=created_at.asc`.
    pub async fn select_rows(
        &self,
        table: &str,
        filter: &str,
        auth_token: Option<&str>,
    ) -> Result<Vec<Value>> {
        let path = format!("/rest/v1/{}?{}", table, filter);
        self.request(Method::GET, &path, auth_token, None).await
    }

    /// Patch rows matching a filter and return the rows actually updated.
    /// An empty result means the filter no longer matched anything.
    pub async fn patch_rows(
        &self,
        table: &str,
        filter: &str,
        patch: Value,
        auth_token: Option<&str>,
    ) -> Result<Vec<Value>> {
        let path = format!("/rest/v1/{}?{}", table, filter);
        self.request(Method::PATCH, &path, auth_token, Some(patch)).await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}
