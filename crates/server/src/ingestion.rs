//! Dealer feed ingestion.
//!
//! The dealer widget serves the inventory in pages. Every page is collected
//! before the repository is touched, so a feed that fails halfway leaves the
//! previous inventory in place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use showroom_core::config::IngestionConfig;
use showroom_core::domain::inventory::CarListing;
use showroom_db::repositories::{InventoryRepository, RepositoryError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("feed request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("feed returned {status} for page starting at {start}")]
    Status { status: reqwest::StatusCode, start: u64 },
    #[error("could not store listings: {0}")]
    Store(#[from] RepositoryError),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedPage {
    pub page_size: u64,
    pub page_start: u64,
    pub total_count: u64,
    pub vehicles: Vec<CarListing>,
}

#[async_trait]
pub trait InventoryFeed: Send + Sync {
    async fn fetch_page(&self, start: u64) -> Result<FeedPage, IngestionError>;
}

pub struct HttpInventoryFeed {
    http: reqwest::Client,
    url: String,
}

impl HttpInventoryFeed {
    pub fn from_config(config: &IngestionConfig) -> Result<Self, IngestionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self { http, url: config.feed_url.clone() })
    }
}

#[async_trait]
impl InventoryFeed for HttpInventoryFeed {
    async fn fetch_page(&self, start: u64) -> Result<FeedPage, IngestionError> {
        let response = self.http.get(&self.url).query(&[("start", start)]).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestionError::Status { status, start });
        }

        let payload: WidgetResponse = response.json().await?;
        Ok(payload.into_page())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetResponse {
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    page_size: u64,
    page_start: u64,
    total_count: u64,
    #[serde(default)]
    tracking_data: Vec<WidgetVehicle>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WidgetVehicle {
    uuid: String,
    vin: Option<String>,
    stock_number: Option<String>,
    make: Option<String>,
    model: Option<String>,
    trim: Option<String>,
    model_code: Option<String>,
    year: Option<i64>,
    model_year: Option<i64>,
    body_style: Option<String>,
    classification: Option<String>,
    doors: Option<String>,
    drive_line: Option<String>,
    transmission: Option<String>,
    fuel_type: Option<String>,
    normal_fuel_type: Option<String>,
    exterior_color: Option<String>,
    interior_color: Option<String>,
    odometer: Option<i64>,
    new_or_used: Option<String>,
    certified: Option<bool>,
    inventory_type: Option<String>,
    inventory_date: Option<String>,
    option_codes: Option<Vec<String>>,
    asking_price: Option<String>,
    sale_price: Option<String>,
    pricing: Option<WidgetPricing>,
    link: Option<String>,
    account_id: Option<String>,
    address: Option<WidgetAddress>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WidgetPricing {
    internet_price: Option<String>,
    final_price: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WidgetAddress {
    account_name: Option<String>,
    city: Option<String>,
    state: Option<String>,
    country: Option<String>,
    postal_code: Option<String>,
}

impl WidgetResponse {
    fn into_page(self) -> FeedPage {
        let info = self.page_info;
        FeedPage {
            page_size: info.page_size,
            page_start: info.page_start,
            total_count: info.total_count,
            vehicles: info.tracking_data.into_iter().map(CarListing::from).collect(),
        }
    }
}

impl From<WidgetVehicle> for CarListing {
    fn from(vehicle: WidgetVehicle) -> Self {
        let pricing = vehicle.pricing.unwrap_or_default();
        let address = vehicle.address.unwrap_or_default();
        Self {
            uuid: vehicle.uuid,
            vin: vehicle.vin,
            stock_number: vehicle.stock_number,
            make: vehicle.make,
            model: vehicle.model,
            trim: vehicle.trim,
            model_code: vehicle.model_code,
            year: vehicle.year,
            model_year: vehicle.model_year,
            body_style: vehicle.body_style,
            classification: vehicle.classification,
            doors: vehicle.doors,
            drive_line: vehicle.drive_line,
            transmission: vehicle.transmission,
            fuel_type: vehicle.fuel_type,
            normal_fuel_type: vehicle.normal_fuel_type,
            exterior_color: vehicle.exterior_color,
            interior_color: vehicle.interior_color,
            odometer: vehicle.odometer,
            new_or_used: vehicle.new_or_used,
            certified: vehicle.certified,
            inventory_type: vehicle.inventory_type,
            inventory_date: vehicle.inventory_date,
            option_codes: vehicle.option_codes.unwrap_or_default(),
            asking_price: vehicle.asking_price,
            sale_price: vehicle.sale_price,
            pricing_internet_price: pricing.internet_price,
            pricing_final_price: pricing.final_price,
            link: vehicle.link,
            account_id: vehicle.account_id,
            address_account_name: address.account_name,
            address_city: address.city,
            address_state: address.state,
            address_country: address.country,
            address_postal_code: address.postal_code,
        }
    }
}

/// Pages through the feed from the first record and replaces the stored
/// inventory with everything collected. Returns the number of listings stored.
pub async fn ingest(
    feed: &dyn InventoryFeed,
    repository: &dyn InventoryRepository,
) -> Result<usize, IngestionError> {
    let mut listings = Vec::new();
    let mut start = 0;

    loop {
        let page = feed.fetch_page(start).await?;
        debug!(
            event_name = "server.ingestion.page_fetched",
            page_start = page.page_start,
            page_size = page.page_size,
            total_count = page.total_count,
            vehicles = page.vehicles.len(),
            "feed page fetched"
        );

        let next = page.page_start.saturating_add(page.page_size);
        if start > 0 && next <= start {
            warn!(
                event_name = "server.ingestion.feed_stalled",
                requested_start = start,
                page_start = page.page_start,
                "feed did not advance past the requested offset, stopping"
            );
            break;
        }
        listings.extend(page.vehicles);

        if page.page_size == 0 || page.total_count <= next {
            break;
        }
        start = next;
    }

    let stored = listings.len();
    repository.replace_all(listings).await?;
    Ok(stored)
}

/// Runs one ingestion now and, when an interval is configured, keeps
/// refreshing in the background. Failures are logged and the next tick
/// retries.
pub fn spawn_refresh<R>(config: &IngestionConfig, repository: Arc<R>) -> Result<(), IngestionError>
where
    R: InventoryRepository + 'static,
{
    let feed = HttpInventoryFeed::from_config(config)?;
    let interval = (config.refresh_interval_secs > 0)
        .then(|| Duration::from_secs(config.refresh_interval_secs));

    tokio::spawn(async move {
        loop {
            run_once(&feed, repository.as_ref()).await;
            match interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => break,
            }
        }
    });

    Ok(())
}

async fn run_once(feed: &dyn InventoryFeed, repository: &dyn InventoryRepository) {
    info!(
        event_name = "server.ingestion.start",
        correlation_id = "ingestion",
        "inventory ingestion started"
    );
    match ingest(feed, repository).await {
        Ok(stored) => info!(
            event_name = "server.ingestion.completed",
            correlation_id = "ingestion",
            listings = stored,
            "inventory ingestion completed"
        ),
        Err(error) => error!(
            event_name = "server.ingestion.failed",
            correlation_id = "ingestion",
            error = %error,
            "inventory ingestion failed"
        ),
    }
}
