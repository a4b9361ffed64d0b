//! Class enrollment lookups owned by the enrollment service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait ClassDirectory: Send + Sync {
    /// Whether `user_id` may post to the class (enrolled student or its instructor)
    async fn is_authorized(&self, class_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn member_ids(&self, class_id: Uuid) -> AppResult<Vec<Uuid>>;
}

/// Rejects everyone. Used when no enrollment service is configured.
#[derive(Debug, Default, Clone)]
pub struct DenyAllClassDirectory;

#[async_trait]
impl ClassDirectory for DenyAllClassDirectory {
    async fn is_authorized(&self, _class_id: Uuid, _user_id: Uuid) -> AppResult<bool> {
        Ok(false)
    }

    async fn member_ids(&self, _class_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(Vec::new())
    }
}

/// Fixed membership table
#[derive(Debug, Default, Clone)]
pub struct StaticClassDirectory {
    classes: HashMap<Uuid, Vec<Uuid>>,
}

impl StaticClassDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class_id: Uuid, members: Vec<Uuid>) -> Self {
        self.classes.insert(class_id, members);
        self
    }
}

#[async_trait]
impl ClassDirectory for StaticClassDirectory {
    async fn is_authorized(&self, class_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        Ok(self
            .classes
            .get(&class_id)
            .map(|m| m.contains(&user_id))
            .unwrap_or(false))
    }

    async fn member_ids(&self, class_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self.classes.get(&class_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    member_ids: Vec<Uuid>,
}

/// Asks the enrollment service over HTTP
#[derive(Clone)]
pub struct HttpClassDirectory {
    client: Client,
    base_url: String,
}

impl HttpClassDirectory {
    pub fn new(base_url: String) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Config(format!("enrollment client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_members(&self, class_id: Uuid) -> AppResult<Option<Vec<Uuid>>> {
        let url = format!("{}/v1/classes/{}/members", self.base_url, class_id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            error!(class_id = %class_id, error = %e, "enrollment service request failed");
            AppError::Internal
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: MembersResponse = response.json().await.map_err(|e| {
                    error!(class_id = %class_id, error = %e, "bad enrollment response");
                    AppError::Internal
                })?;
                Ok(Some(body.member_ids))
            }
            status => {
                error!(class_id = %class_id, status = %status, "enrollment service error");
                Err(AppError::Internal)
            }
        }
    }
}

#[async_trait]
impl ClassDirectory for HttpClassDirectory {
    async fn is_authorized(&self, class_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        Ok(self
            .fetch_members(class_id)
            .await?
            .map(|m| m.contains(&user_id))
            .unwrap_or(false))
    }

    async fn member_ids(&self, class_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self.fetch_members(class_id).await?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_membership() {
        let class = Uuid::new_v4();
        let member = Uuid::new_v4();
        let dir = StaticClassDirectory::new().with_class(class, vec![member]);

        assert!(dir.is_authorized(class, member).await.unwrap());
        assert!(!dir.is_authorized(class, Uuid::new_v4()).await.unwrap());
        assert!(!dir.is_authorized(Uuid::new_v4(), member).await.unwrap());
        assert_eq!(dir.member_ids(class).await.unwrap(), vec![member]);
    }

    #[tokio::test]
    async fn test_deny_all() {
        let dir = DenyAllClassDirectory;
        assert!(!dir.is_authorized(Uuid::new_v4(), Uuid::new_v4()).await.unwrap());
    }
}
