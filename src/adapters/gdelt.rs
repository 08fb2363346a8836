//! GDELT 2.0 event export as a discovery source.
//!
//! `lastupdate.txt` lists the newest 15-minute files as
//! `<size> <md5> <url>` lines. The event export is a zipped, tab-separated
//! file; rows with a strong average tone point at high-impact articles.

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{status_error, transport_error, NewsDiscovery};
use crate::core::activities::ActivityError;

pub const DEFAULT_UPDATE_URL: &str = "http://data.gdeltproject.org/gdeltv2/lastupdate.txt";
pub const DEFAULT_TONE_THRESHOLD: f64 = 5.0;

const EXPORT_MARKER: &str = ".export.CSV.zip";
const MIN_COLUMNS: usize = 58;
const TONE_COLUMN: usize = 34;

pub struct GdeltDiscovery {
    client: reqwest::Client,
    update_url: String,
    tone_threshold: f64,
}

impl GdeltDiscovery {
    pub fn new(update_url: String, tone_threshold: f64, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            update_url,
            tone_threshold,
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ActivityError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, "gdelt request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, url, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, "gdelt body read failed"))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl NewsDiscovery for GdeltDiscovery {
    async fn discover(&self) -> Result<Vec<String>, ActivityError> {
        let listing = self.fetch_bytes(&self.update_url).await?;
        let listing = String::from_utf8_lossy(&listing);

        let export_url = latest_export_url(&listing).ok_or_else(|| {
            ActivityError::Transient("no event export listed in lastupdate.txt".to_string())
        })?;
        info!(url = %export_url, "Downloading GDELT export");

        let archive = self.fetch_bytes(&export_url).await?;
        let threshold = self.tone_threshold;
        let urls = tokio::task::spawn_blocking(move || urls_from_archive(&archive, threshold))
            .await
            .map_err(|e| ActivityError::Transient(format!("export parse task failed: {}", e)))??;

        debug!(count = urls.len(), "High-impact URLs found");
        Ok(urls)
    }
}

/// URL of the event export named in a `lastupdate.txt` listing
pub fn latest_export_url(listing: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_, _, url, ..] if url.contains(EXPORT_MARKER) => Some(url.to_string()),
            _ => None,
        }
    })
}

/// Unzip an export archive and collect the high-impact URLs of every CSV in it
pub fn urls_from_archive(data: &[u8], threshold: f64) -> Result<Vec<String>, ActivityError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| ActivityError::Malformed(format!("export is not a zip archive: {}", e)))?;

    let mut urls = Vec::new();
    let mut seen = HashSet::new();

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ActivityError::Malformed(format!("unreadable zip entry: {}", e)))?;
        if !file.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| ActivityError::Malformed(format!("zip entry read failed: {}", e)))?;

        for url in high_impact_urls(&String::from_utf8_lossy(&raw), threshold) {
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
    }

    Ok(urls)
}

/// Source URLs of rows whose |tone| exceeds `threshold`, deduplicated in file order.
/// Short rows and rows with an unparseable tone are skipped.
pub fn high_impact_urls(tsv: &str, threshold: f64) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for line in tsv.lines() {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() < MIN_COLUMNS {
            continue;
        }

        let tone = match columns[TONE_COLUMN].trim().parse::<f64>() {
            Ok(tone) => tone,
            Err(_) => continue,
        };
        if tone.abs() <= threshold {
            continue;
        }

        let url = columns[columns.len() - 1].trim();
        if url.starts_with("http") && seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }

    urls
}
