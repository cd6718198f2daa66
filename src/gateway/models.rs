//! Provider payloads and their normalized forms.
//!
//! `Raw*` structs mirror what each provider sends, with every field a
//! provider may omit marked optional. The normalized structs are what the
//! rest of the service sees and what gets cached.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub(crate) const NO_DESCRIPTION: &str = "No description available";
pub(crate) const UNKNOWN_AUTHOR: &str = "Unknown";
pub(crate) const UNKNOWN_CONDITIONS: &str = "unknown";

// == Weather ==
#[derive(Debug, Deserialize)]
pub(crate) struct RawWeather {
    pub name: String,
    #[serde(default)]
    pub sys: RawWeatherSys,
    pub main: RawWeatherMain,
    #[serde(default)]
    pub weather: Vec<RawWeatherCondition>,
    #[serde(default)]
    pub wind: RawWind,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawWeatherSys {
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawWeatherMain {
    pub temp: f64,
    pub feels_like: Option<f64>,
    pub humidity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawWeatherCondition {
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawWind {
    pub speed: Option<f64>,
}

/// Current conditions for a city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub city: String,
    pub country: String,
    /// Celsius
    pub temperature: f64,
    pub feels_like: f64,
    pub humidity: u32,
    pub description: String,
    /// Metres per second
    pub wind_speed: f64,
}

impl From<RawWeather> for WeatherReport {
    fn from(raw: RawWeather) -> Self {
        let description = raw
            .weather
            .into_iter()
            .find_map(|condition| condition.description)
            .unwrap_or_else(|| UNKNOWN_CONDITIONS.to_string());
        Self {
            city: raw.name,
            country: raw.sys.country.unwrap_or_default(),
            temperature: raw.main.temp,
            feels_like: raw.main.feels_like.unwrap_or(raw.main.temp),
            humidity: raw.main.humidity.unwrap_or(0),
            description,
            wind_speed: raw.wind.speed.unwrap_or(0.0),
        }
    }
}

// == News ==
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawNews {
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub articles: Vec<RawArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawArticle {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub source: RawSource,
    pub published_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawSource {
    pub name: Option<String>,
}

/// One headline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsArticle {
    pub title: String,
    pub description: String,
    pub url: String,
    pub source: String,
    pub published_at: Option<String>,
}

/// Top headlines for a country and category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsFeed {
    pub country: String,
    pub category: String,
    pub total_results: u64,
    pub articles: Vec<NewsArticle>,
}

impl From<RawArticle> for NewsArticle {
    fn from(raw: RawArticle) -> Self {
        Self {
            title: raw.title.unwrap_or_default(),
            description: raw
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
            url: raw.url.unwrap_or_default(),
            source: raw.source.name.unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            published_at: raw.published_at,
        }
    }
}

impl NewsFeed {
    pub(crate) fn from_raw(raw: RawNews, country: &str, category: &str) -> Self {
        Self {
            country: country.to_string(),
            category: category.to_string(),
            total_results: raw.total_results,
            articles: raw.articles.into_iter().map(NewsArticle::from).collect(),
        }
    }
}

// == Exchange Rates ==
#[derive(Debug, Deserialize)]
pub(crate) struct RawRates {
    pub result: String,
    pub base_code: Option<String>,
    #[serde(default)]
    pub rates: BTreeMap<String, f64>,
    pub time_last_update_utc: Option<String>,
}

/// Conversion rates from one base currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRates {
    pub base: String,
    pub rates: BTreeMap<String, f64>,
    pub updated_at: Option<String>,
}

impl ExchangeRates {
    pub(crate) fn from_raw(raw: RawRates, requested_base: &str) -> Self {
        Self {
            base: raw.base_code.unwrap_or_else(|| requested_base.to_string()),
            rates: raw.rates,
            updated_at: raw.time_last_update_utc,
        }
    }
}

// == Code-hosting Profile ==
#[derive(Debug, Deserialize)]
pub(crate) struct RawProfile {
    pub login: String,
    pub name: Option<String>,
    pub bio: Option<String>,
    #[serde(default)]
    pub public_repos: u64,
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub following: u64,
    pub avatar_url: Option<String>,
    pub html_url: Option<String>,
}

/// Public profile of a code-hosting user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperProfile {
    pub login: String,
    pub name: String,
    pub bio: String,
    pub public_repos: u64,
    pub followers: u64,
    pub following: u64,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
}

impl From<RawProfile> for DeveloperProfile {
    fn from(raw: RawProfile) -> Self {
        Self {
            name: raw.name.unwrap_or_else(|| raw.login.clone()),
            login: raw.login,
            bio: raw.bio.unwrap_or_default(),
            public_repos: raw.public_repos,
            followers: raw.followers,
            following: raw.following,
            avatar_url: raw.avatar_url,
            profile_url: raw.html_url,
        }
    }
}

// == Quote ==
#[derive(Debug, Deserialize)]
pub(crate) struct RawQuote {
    pub content: String,
    pub author: Option<String>,
}

/// A random quotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub content: String,
    pub author: String,
}

impl From<RawQuote> for Quote {
    fn from(raw: RawQuote) -> Self {
        Self {
            content: raw.content,
            author: raw
                .author
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
        }
    }
}
