//! External API gateway.
//!
//! One method per provider capability. Each call goes through the request
//! cache under a capability-scoped key and TTL; on a miss the provider is
//! called with a hard timeout and its answer normalized. Any transport,
//! status or decoding failure becomes `GatewayError::UpstreamUnavailable`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::models::{
    DeveloperProfile, ExchangeRates, NewsFeed, Quote, RawNews, RawProfile, RawQuote, RawRates,
    RawWeather, WeatherReport,
};
use crate::cache::{CacheKey, Cached, RequestCache};
use crate::error::GatewayError;

// == Capability TTLs ==
pub const WEATHER_TTL: Duration = Duration::from_secs(600);
pub const NEWS_TTL: Duration = Duration::from_secs(1800);
pub const EXCHANGE_TTL: Duration = Duration::from_secs(3600);
pub const PROFILE_TTL: Duration = Duration::from_secs(3600);
pub const QUOTE_TTL: Duration = Duration::from_secs(60);

/// Provider endpoints and credentials.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub timeout: Duration,
    pub weather_url: String,
    pub weather_api_key: String,
    pub news_url: String,
    pub news_api_key: String,
    pub exchange_url: String,
    pub github_url: String,
    pub quote_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            weather_url: "https://api.openweathermap.org/data/2.5".to_string(),
            weather_api_key: String::new(),
            news_url: "https://newsapi.org/v2".to_string(),
            news_api_key: String::new(),
            exchange_url: "https://open.er-api.com/v6".to_string(),
            github_url: "https://api.github.com".to_string(),
            quote_url: "https://api.quotable.io".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Points every provider at one base URL; used against mock servers.
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self {
            weather_url: base.clone(),
            news_url: base.clone(),
            exchange_url: base.clone(),
            github_url: base.clone(),
            quote_url: base,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// == Path Segments ==
/// Normalizes a three-letter currency code to upper case.
fn currency_code(base: &str) -> Result<String, GatewayError> {
    let base = base.trim();
    if base.len() != 3 || !base.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(GatewayError::InvalidInput(
            "Base currency must be a three-letter code".to_string(),
        ));
    }
    Ok(base.to_ascii_uppercase())
}

/// Normalizes a GitHub login: 1 to 39 ASCII letters, digits or hyphens.
fn github_login(username: &str) -> Result<String, GatewayError> {
    let username = username.trim();
    let valid = (1..=39).contains(&username.len())
        && username.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
    if !valid {
        return Err(GatewayError::InvalidInput(format!(
            "'{}' is not a valid GitHub username",
            username
        )));
    }
    Ok(username.to_ascii_lowercase())
}

/// Cached, normalized access to third-party providers.
#[derive(Clone)]
pub struct ExternalApiGateway {
    client: reqwest::Client,
    cache: RequestCache,
    config: GatewayConfig,
}

impl ExternalApiGateway {
    pub fn new(config: GatewayConfig, cache: RequestCache) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("gatekeep/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            cache,
            config,
        })
    }

    // == Capabilities ==
    /// Current weather for `city` (metric units).
    pub async fn fetch_weather(&self, city: &str) -> Result<Cached<WeatherReport>, GatewayError> {
        let key = CacheKey::scoped("weather", &[&city.trim().to_lowercase()]);
        let url = format!("{}/weather", self.config.weather_url);
        self.cache
            .get_or_fetch(key.as_str(), WEATHER_TTL, || async {
                let raw: RawWeather = self
                    .fetch_json(
                        "weather",
                        &url,
                        &[
                            ("q", city.trim()),
                            ("appid", self.config.weather_api_key.as_str()),
                            ("units", "metric"),
                        ],
                        Some(format!("City '{}' not found", city.trim())),
                    )
                    .await?;
                Ok(WeatherReport::from(raw))
            })
            .await
    }

    /// Top headlines for `country` in `category`.
    pub async fn fetch_news(
        &self,
        country: &str,
        category: &str,
    ) -> Result<Cached<NewsFeed>, GatewayError> {
        let country = country.trim().to_lowercase();
        let category = category.trim().to_lowercase();
        let key = CacheKey::scoped("news", &[&country, &category]);
        let url = format!("{}/top-headlines", self.config.news_url);
        self.cache
            .get_or_fetch(key.as_str(), NEWS_TTL, || async {
                let raw: RawNews = self
                    .fetch_json(
                        "news",
                        &url,
                        &[
                            ("country", country.as_str()),
                            ("category", category.as_str()),
                            ("apiKey", self.config.news_api_key.as_str()),
                        ],
                        None,
                    )
                    .await?;
                Ok(NewsFeed::from_raw(raw, &country, &category))
            })
            .await
    }

    /// Conversion rates from `base`.
    pub async fn fetch_exchange_rates(
        &self,
        base: &str,
    ) -> Result<Cached<ExchangeRates>, GatewayError> {
        let base = currency_code(base)?;
        let key = CacheKey::scoped("exchange", &[&base]);
        let url = format!("{}/latest/{}", self.config.exchange_url, base);
        self.cache
            .get_or_fetch(key.as_str(), EXCHANGE_TTL, || async {
                let raw: RawRates = self
                    .fetch_json(
                        "exchange",
                        &url,
                        &[],
                        Some(format!("Currency '{}' not supported", base)),
                    )
                    .await?;
                if raw.result != "success" {
                    return Err(GatewayError::unavailable(
                        "exchange",
                        format!("provider answered '{}'", raw.result),
                    ));
                }
                Ok(ExchangeRates::from_raw(raw, &base))
            })
            .await
    }

    /// Public profile of `username`.
    pub async fn fetch_github_profile(
        &self,
        username: &str,
    ) -> Result<Cached<DeveloperProfile>, GatewayError> {
        let username = github_login(username)?;
        let key = CacheKey::scoped("github", &[&username]);
        let url = format!("{}/users/{}", self.config.github_url, username);
        self.cache
            .get_or_fetch(key.as_str(), PROFILE_TTL, || async {
                let raw: RawProfile = self
                    .fetch_json(
                        "github",
                        &url,
                        &[],
                        Some(format!("User '{}' not found", username)),
                    )
                    .await?;
                Ok(DeveloperProfile::from(raw))
            })
            .await
    }

    /// A random quote.
    pub async fn fetch_quote(&self) -> Result<Cached<Quote>, GatewayError> {
        let key = CacheKey::scoped("quote", &["random"]);
        let url = format!("{}/random", self.config.quote_url);
        self.cache
            .get_or_fetch(key.as_str(), QUOTE_TTL, || async {
                let raw: RawQuote = self.fetch_json("quote", &url, &[], None).await?;
                Ok(Quote::from(raw))
            })
            .await
    }

    // == Transport ==
    /// GETs `url` and decodes the body.
    ///
    /// A 404 maps to `NotFound(not_found)` when the capability looks up a
    /// named resource; every other failure is `UpstreamUnavailable`.
    async fn fetch_json<R: DeserializeOwned>(
        &self,
        provider: &'static str,
        url: &str,
        query: &[(&str, &str)],
        not_found: Option<String>,
    ) -> Result<R, GatewayError> {
        debug!(provider, url = %url, "Calling upstream");
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    e.to_string()
                };
                warn!(provider, error = %reason, "Upstream call failed");
                GatewayError::unavailable(provider, reason)
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(what) = not_found {
                return Err(GatewayError::NotFound(what));
            }
        }
        if !status.is_success() {
            warn!(provider, status = %status, "Upstream returned an error status");
            return Err(GatewayError::unavailable(provider, format!("status {}", status)));
        }

        response.json::<R>().await.map_err(|e| {
            warn!(provider, error = %e, "Upstream body could not be decoded");
            GatewayError::unavailable(provider, e)
        })
    }
}
