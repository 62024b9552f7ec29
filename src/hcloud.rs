//! Hetzner Cloud API client.
//!
//! Only the slice of the API the controller needs: name lookups at
//! construction, server create with a watched action, and server delete.
//! Name lookups happen once and failures there are fatal, so a typo in the
//! configuration surfaces at startup rather than on first traffic.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";

const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The controller's handle to the one server it owns.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub ipv4: Ipv4Addr,
}

/// Cloud-provider seam consumed by the lifecycle controller.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    /// Create a server and block until its creation action completes.
    async fn create_server(&self, name: &str, user_data: &str) -> Result<Server, ProviderError>;

    /// Delete the server with the given id.
    async fn delete_server(&self, id: u64) -> Result<(), ProviderError>;
}

#[derive(Debug)]
pub struct HcloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    server_type: u64,
    image: u64,
    location: Option<u64>,
}

impl HcloudClient {
    /// Build a client against the production API, resolving the configured
    /// server type, image and location names to ids.
    pub async fn new(
        token: &str,
        server_type: &str,
        image: &str,
        location: Option<&str>,
    ) -> Result<Self, ProviderError> {
        Self::with_base_url(DEFAULT_BASE_URL, token, server_type, image, location).await
    }

    pub async fn with_base_url(
        base_url: &str,
        token: &str,
        server_type: &str,
        image: &str,
        location: Option<&str>,
    ) -> Result<Self, ProviderError> {
        let mut client = Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            server_type: 0,
            image: 0,
            location: None,
        };
        client.server_type = client.lookup("server_types", "server type", server_type).await?;
        client.image = client.lookup("images", "image", image).await?;
        if let Some(name) = location {
            client.location = Some(client.lookup("locations", "location", name).await?);
        }
        Ok(client)
    }

    /// Resolve a named resource to its id via `GET /{collection}?name=`.
    async fn lookup(
        &self,
        collection: &'static str,
        kind: &'static str,
        name: &str,
    ) -> Result<u64, ProviderError> {
        let body = self
            .request(Method::GET, &format!("/{collection}?name={name}"), None)
            .await?;
        body[collection][0]["id"]
            .as_u64()
            .ok_or_else(|| ProviderError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body: Value = resp.json().await.unwrap_or_default();
            return Err(ProviderError::Api {
                code: body["error"]["code"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                message: body["error"]["message"]
                    .as_str()
                    .unwrap_or_else(|| status.as_str())
                    .to_string(),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(resp.json().await?)
    }

    /// Poll an action until it reports success or error.
    async fn watch_action(&self, id: u64) -> Result<(), ProviderError> {
        loop {
            let body = self
                .request(Method::GET, &format!("/actions/{id}"), None)
                .await?;
            match body["action"]["status"].as_str() {
                Some("success") => return Ok(()),
                Some("error") => {
                    let message = body["action"]["error"]["message"]
                        .as_str()
                        .unwrap_or("unknown")
                        .to_string();
                    return Err(ProviderError::ActionFailed { id, message });
                }
                _ => {
                    debug!(
                        action = id,
                        progress = body["action"]["progress"].as_u64().unwrap_or(0),
                        "Waiting for action"
                    );
                    tokio::time::sleep(ACTION_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[async_trait]
impl ServerProvider for HcloudClient {
    async fn create_server(&self, name: &str, user_data: &str) -> Result<Server, ProviderError> {
        info!(server = %name, "Creating server");

        let mut body = json!({
            "name": name,
            "server_type": self.server_type,
            "image": self.image,
            "user_data": user_data,
        });
        if let Some(location) = self.location {
            body["location"] = location.into();
        }

        let resp = self.request(Method::POST, "/servers", Some(&body)).await?;
        let id = resp["server"]["id"]
            .as_u64()
            .ok_or(ProviderError::Malformed("server.id"))?;
        let ipv4: Ipv4Addr = resp["server"]["public_net"]["ipv4"]["ip"]
            .as_str()
            .and_then(|ip| ip.parse().ok())
            .ok_or(ProviderError::Malformed("server.public_net.ipv4.ip"))?;
        let action = resp["action"]["id"]
            .as_u64()
            .ok_or(ProviderError::Malformed("action.id"))?;

        info!(server = %name, "Waiting for server to start");
        self.watch_action(action).await?;

        info!(server = %name, id, ip = %ipv4, "Server created");
        Ok(Server {
            id,
            name: name.to_string(),
            ipv4,
        })
    }

    async fn delete_server(&self, id: u64) -> Result<(), ProviderError> {
        info!(server_id = id, "Deleting server");
        self.request(Method::DELETE, &format!("/servers/{id}"), None)
            .await?;
        info!(server_id = id, "Server deleted");
        Ok(())
    }
}
