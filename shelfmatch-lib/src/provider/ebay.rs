use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::provider::{Provider, ProviderItem};
use crate::{Error, Result};

const PROVIDER_NAME: &str = "ebay";
const TOKEN_REQUEST_BODY: &str =
    "grant_type=client_credentials&scope=https://api.ebay.com/oauth/api_scope";

/// Which eBay deployment to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EbayEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl EbayEnvironment {
    #[must_use]
    pub fn oauth_url(self) -> &'static str {
        match self {
            Self::Sandbox => "https://api.sandbox.ebay.com/identity/v1/oauth2/token",
            Self::Production => "https://api.ebay.com/identity/v1/oauth2/token",
        }
    }

    #[must_use]
    pub fn search_by_image_url(self) -> &'static str {
        match self {
            Self::Sandbox => {
                "https://api.sandbox.ebay.com/buy/browse/v1/item_summary/search_by_image"
            }
            Self::Production => "https://api.ebay.com/buy/browse/v1/item_summary/search_by_image",
        }
    }
}

impl FromStr for EbayEnvironment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "production" => Ok(Self::Production),
            other => Err(Error::InvalidInput(format!(
                "unknown eBay environment {other:?}, expected sandbox or production"
            ))),
        }
    }
}

/// Credentials and endpoints for [`EbayProvider`]
#[derive(Debug, Clone)]
pub struct EbayConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub environment: EbayEnvironment,
    /// Per-request time limit, covering both token and search calls
    pub timeout: Duration,
}

impl Default for EbayConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            environment: EbayEnvironment::Sandbox,
            timeout: Duration::from_secs(30),
        }
    }
}

/// eBay Browse API image search.
///
/// Each search fetches a fresh client-credentials token and then calls
/// `item_summary/search_by_image`. Listings come back unscored.
pub struct EbayProvider {
    client: reqwest::Client,
    config: EbayConfig,
}

impl EbayProvider {
    pub fn new(config: EbayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .map_err(|e| Error::provider(PROVIDER_NAME, e))?;
        Ok(Self { client, config })
    }

    async fn access_token(&self) -> Result<String> {
        let (Some(id), Some(secret)) = (
            self.config.client_id.as_deref().filter(|s| !s.is_empty()),
            self.config.client_secret.as_deref().filter(|s| !s.is_empty()),
        ) else {
            return Err(Error::provider(
                PROVIDER_NAME,
                "EBAY_CLIENT_ID and EBAY_CLIENT_SECRET must be set to use eBay",
            ));
        };

        let response = self
            .client
            .post(self.config.environment.oauth_url())
            .basic_auth(id, Some(secret))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(TOKEN_REQUEST_BODY)
            .send()
            .await
            .map_err(|e| Error::provider(PROVIDER_NAME, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider(PROVIDER_NAME, e))?;
        if status != StatusCode::OK {
            return Err(Error::provider(
                PROVIDER_NAME,
                format!("token error: {} {body}", status.as_u16()),
            ));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider(PROVIDER_NAME, format!("token response: {e}")))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl Provider for EbayProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn search_by_image(&self, image: &[u8], limit: usize) -> Result<Vec<ProviderItem>> {
        let token = self.access_token().await?;
        let request = SearchRequest {
            image: STANDARD.encode(image),
            limit,
        };

        let response = self
            .client
            .post(self.config.environment.search_by_image_url())
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::provider(PROVIDER_NAME, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider(PROVIDER_NAME, e))?;
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), body = %body, "eBay search failed");
            return Ok(Vec::new());
        }

        let payload: Value = serde_json::from_str(&body)
            .map_err(|e| Error::provider(PROVIDER_NAME, format!("search response: {e}")))?;
        let mut items = parse_search_response(&payload);
        items.truncate(limit);
        Ok(items)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    image: String,
    limit: usize,
}

/// Validate the `itemSummaries` of a Browse API response.
///
/// Summaries without a title are dropped; every other field is optional.
#[must_use]
pub fn parse_search_response(payload: &Value) -> Vec<ProviderItem> {
    let Some(summaries) = payload.get("itemSummaries").and_then(Value::as_array) else {
        return Vec::new();
    };

    summaries
        .iter()
        .filter_map(|summary| {
            let item = parse_item_summary(summary);
            if item.is_none() {
                debug!("dropping eBay item summary without a title");
            }
            item
        })
        .collect()
}

fn parse_item_summary(summary: &Value) -> Option<ProviderItem> {
    let title = summary.get("title")?.as_str()?.to_string();
    let external_id = summary
        .get("itemId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let image_url = summary
        .get("image")
        .and_then(|image| image.get("imageUrl"))
        .and_then(Value::as_str)
        .or_else(|| {
            summary
                .get("thumbnailImages")
                .and_then(Value::as_array)
                .and_then(|thumbs| thumbs.first())
                .and_then(|thumb| thumb.get("imageUrl"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);

    let price = summary.get("price").and_then(|price| match price {
        Value::Object(fields) => fields.get("value").and_then(scalar_to_string),
        other => scalar_to_string(other),
    });

    let detail_link = summary
        .get("itemWebUrl")
        .and_then(Value::as_str)
        .map(str::to_string);
    let seller_domain = detail_link
        .as_deref()
        .and_then(|link| Url::parse(link).ok())
        .and_then(|url| url.host_str().map(str::to_string));

    Some(ProviderItem {
        external_id,
        title,
        image_url,
        price,
        detail_link,
        seller_domain,
        raw: summary.clone(),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
