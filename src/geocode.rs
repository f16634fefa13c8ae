//! Reverse geocoding for mylocations.
//!
//! This module converts a coordinate into zero or more street addresses.
//!
//! It defines the `Address` struct shown to the user and the `GeocodingService`
//! trait as the interface the session driver calls. Two implementations exist:
//! an offline mock that knows a handful of places, and a client for
//! Nominatim-compatible HTTP reverse geocoding endpoints.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::config::{GeocoderConfig, GeocoderKind};
use crate::error::GeocodeError;

/// A street address, every component optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    /// House number (e.g., "1")
    pub street_number: Option<String>,
    /// Street name (e.g., "Infinite Loop")
    pub street: Option<String>,
    /// City, town or village
    pub city: Option<String>,
    /// State, province or other administrative area
    pub region: Option<String>,
    pub postal_code: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.street_number.is_none()
            && self.street.is_none()
            && self.city.is_none()
            && self.region.is_none()
            && self.postal_code.is_none()
    }
}

fn join_parts(parts: &[&Option<String>]) -> String {
    parts
        .iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let street_line = join_parts(&[&self.street_number, &self.street]);
        let city_line = join_parts(&[&self.city, &self.region, &self.postal_code]);

        match (street_line.is_empty(), city_line.is_empty()) {
            (false, false) => write!(f, "{street_line}\n{city_line}"),
            (false, true) => write!(f, "{street_line}"),
            (true, _) => write!(f, "{city_line}"),
        }
    }
}

/// Interface for reverse geocoding services
#[async_trait]
pub trait GeocodingService: Send + Sync {
    /// Look up the addresses at a coordinate. An empty list means nothing was found.
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<Address>, GeocodeError>;
}

/// Mock geocoding service for testing and offline use
pub struct MockGeocodingService;

fn address(number: &str, street: &str, city: &str, region: &str, postal_code: &str) -> Address {
    Address {
        street_number: Some(number.to_string()),
        street: Some(street.to_string()),
        city: Some(city.to_string()),
        region: Some(region.to_string()),
        postal_code: Some(postal_code.to_string()),
    }
}

#[async_trait]
impl GeocodingService for MockGeocodingService {
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<Address>, GeocodeError> {
        // Chicago area (roughly)
        if latitude > 41.5 && latitude < 42.0 && longitude > -88.0 && longitude < -87.5 {
            return Ok(vec![address(
                "233",
                "S Wacker Dr",
                "Chicago",
                "IL",
                "60606",
            )]);
        }

        // Cupertino area (roughly)
        if latitude > 37.2 && latitude < 37.4 && longitude > -122.1 && longitude < -121.9 {
            return Ok(vec![address(
                "1",
                "Infinite Loop",
                "Cupertino",
                "CA",
                "95014",
            )]);
        }

        // London area (roughly)
        if latitude > 51.0 && latitude < 52.0 && longitude > -0.5 && longitude < 0.5 {
            return Ok(vec![address(
                "10",
                "Downing Street",
                "London",
                "England",
                "SW1A 2AA",
            )]);
        }

        debug!("Mock geocoder has no address for {latitude:.4}, {longitude:.4}");
        Ok(Vec::new())
    }
}

/// Reverse geocoding against a Nominatim-compatible `/reverse` endpoint
pub struct NominatimGeocodingService {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<NominatimAddress>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    house_number: Option<String>,
    road: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    postcode: Option<String>,
}

impl From<NominatimAddress> for Address {
    fn from(raw: NominatimAddress) -> Self {
        Address {
            street_number: raw.house_number,
            street: raw.road,
            city: raw.city.or(raw.town).or(raw.village),
            region: raw.state,
            postal_code: raw.postcode,
        }
    }
}

impl NominatimGeocodingService {
    pub fn new(base_url: &str, user_agent: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid geocoder base URL {base_url}: {e}"))?;
        let client = Client::builder().user_agent(user_agent).build()?;

        Ok(Self { client, base_url })
    }

    fn reverse_url(&self, latitude: f64, longitude: f64) -> Result<Url, GeocodeError> {
        let mut url = self
            .base_url
            .join("reverse")
            .map_err(|e| GeocodeError::Http(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("format", "jsonv2")
            .append_pair("lat", &latitude.to_string())
            .append_pair("lon", &longitude.to_string());
        Ok(url)
    }
}

#[async_trait]
impl GeocodingService for NominatimGeocodingService {
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<Address>, GeocodeError> {
        let url = self.reverse_url(latitude, longitude)?;
        debug!("Reverse geocoding via {url}");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Geocoding service answered {status}");
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body: ReverseResponse = response.json().await?;
        if let Some(reason) = body.error {
            debug!("Geocoding service found nothing: {reason}");
            return Ok(Vec::new());
        }

        Ok(body
            .address
            .map(Address::from)
            .filter(|address| !address.is_empty())
            .into_iter()
            .collect())
    }
}

/// Factory function to create the configured geocoding service
pub fn create_geocoding_service(
    config: &GeocoderConfig,
) -> anyhow::Result<Arc<dyn GeocodingService>> {
    match config.kind {
        GeocoderKind::Mock => Ok(Arc::new(MockGeocodingService)),
        GeocoderKind::Nominatim => Ok(Arc::new(NominatimGeocodingService::new(
            &config.base_url,
            &config.user_agent,
        )?)),
    }
}
