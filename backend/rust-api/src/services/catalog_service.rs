use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;

use crate::models::LearningItem;

#[derive(Debug, Deserialize)]
struct CatalogItem {
    id: String,
    term: String,
    translation: String,
}

#[derive(Debug, Deserialize)]
struct CatalogPoolResponse {
    items: Vec<CatalogItem>,
}

/// Read-only client for the item catalog. The catalog owns pool contents and
/// ordering; `original_index` is assigned from list position here and nowhere
/// else.
#[derive(Clone)]
pub struct CatalogService {
    http_client: Client,
    base_url: String,
}

impl CatalogService {
    pub fn new(http_client: Client, base_url: String) -> Self {
        Self {
            http_client,
            base_url,
        }
    }

    pub async fn fetch_pool(&self, assignment_id: &str) -> Result<Vec<LearningItem>> {
        let url = format!(
            "{}/internal/assignments/{}/items",
            self.base_url, assignment_id
        );

        let response = self
            .http_client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .context("Failed to call item catalog API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Item catalog returned error {}: {}",
                status,
                error_text
            ));
        }

        let pool: CatalogPoolResponse = response
            .json()
            .await
            .context("Failed to parse item catalog response")?;

        Ok(pool
            .items
            .into_iter()
            .enumerate()
            .map(|(original_index, item)| LearningItem {
                id: item.id,
                term: item.term,
                translation: item.translation,
                original_index,
            })
            .collect())
    }
}
