use async_trait::async_trait;
use kura_core::{value, Delivery, QueueItem, Result, WorldError};
use reqwest::{header, Client, StatusCode};
use tracing::debug;

/// Header carrying the item id, so receivers can drop redeliveries.
pub const ITEM_ID_HEADER: &str = "x-kura-item-id";

/// Delivers items as JSON `POST`s to `<base_url>/<target>`.
///
/// Network errors, `429` and `5xx` responses are transient and retried by
/// the queue; any other non-success status fails the item.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    client: Client,
    base_url: String,
}

impl HttpDelivery {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, target: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            target.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn deliver(&self, item: &QueueItem) -> Result<()> {
        let url = self.url(&item.target);
        let body = value::encode_value(&item.payload)?;
        debug!("POST {} for item '{}'", url, item.id);

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(ITEM_ID_HEADER, item.id.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| WorldError::transient(format!("POST {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(WorldError::transient(format!("POST {url} returned {status}")))
        } else {
            Err(WorldError::Delivery {
                item_id: item.id.to_string(),
                attempts: 1,
                details: format!("POST {url} returned {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let delivery = HttpDelivery::new("http://localhost:3000/hooks/");
        assert_eq!(
            delivery.url("/run/wrun_1"),
            "http://localhost:3000/hooks/run/wrun_1"
        );
    }
}
