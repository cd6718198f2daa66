//! External API Gateway Module
//!
//! Normalized, cached access to weather, news, exchange rate, code-hosting
//! profile and quote providers.

mod client;
mod models;

pub use client::{
    ExternalApiGateway, GatewayConfig, EXCHANGE_TTL, NEWS_TTL, PROFILE_TTL, QUOTE_TTL,
    WEATHER_TTL,
};
pub use models::{DeveloperProfile, ExchangeRates, NewsArticle, NewsFeed, Quote, WeatherReport};
