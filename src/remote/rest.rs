use super::Remote;
use crate::errors::{AppError, AppResult};
use crate::models::{AppData, NotificationItem, ServiceRecord, User};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};

/// JSON-over-HTTP portal backend.
#[derive(Debug, Clone)]
pub struct RestRemote {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl RestRemote {
    pub fn new(base_url: &str, token: Option<String>) -> AppResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|error| AppError::Validation(format!("Invalid remote URL '{}': {}", base_url, error)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Validation(format!("Remote URL '{}' cannot carry paths", base_url)));
        }
        let client = Client::builder()
            .user_agent(concat!("social-hub/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: token.filter(|token| !token.trim().is_empty()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| AppError::Internal("remote base URL cannot carry paths".to_string()))?;
            path.pop_if_empty();
            path.push("api");
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> AppResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|error| AppError::Remote(format!("{} failed: {}", what, error)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(request = what, status = %status, "remote rejected request");
            return Err(AppError::Remote(format!(
                "{} returned {}{}",
                what,
                status,
                if body.trim().is_empty() {
                    String::new()
                } else {
                    format!(": {}", body.trim())
                }
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Remote for RestRemote {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn bootstrap(&self) -> AppResult<AppData> {
        let url = self.endpoint(&["bootstrap"])?;
        let response = self.send(self.request(Method::GET, url), "GET bootstrap").await?;
        response
            .json::<AppData>()
            .await
            .map_err(|error| AppError::Remote(format!("bootstrap payload was not valid app data: {}", error)))
    }

    async fn save_service(&self, service_id: &str, record: &ServiceRecord) -> AppResult<()> {
        let url = self.endpoint(&["services", service_id])?;
        self.send(self.request(Method::PATCH, url).json(record), "PATCH service")
            .await?;
        Ok(())
    }

    async fn save_notifications(&self, notifications: &[NotificationItem]) -> AppResult<()> {
        let url = self.endpoint(&["notifications"])?;
        self.send(self.request(Method::PUT, url).json(notifications), "PUT notifications")
            .await?;
        Ok(())
    }

    async fn save_user(&self, key: &str, user: &User) -> AppResult<()> {
        let url = self.endpoint(&["users", key])?;
        self.send(self.request(Method::PUT, url).json(user), "PUT user").await?;
        Ok(())
    }

    async fn delete_user(&self, key: &str) -> AppResult<()> {
        let url = self.endpoint(&["users", key])?;
        self.send(self.request(Method::DELETE, url), "DELETE user").await?;
        Ok(())
    }
}
