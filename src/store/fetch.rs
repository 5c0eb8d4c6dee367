// src/store/fetch.rs

//! Network transport for image downloads

use crate::error::{Error, FetchFailure, Result};
use reqwest::blocking::Client;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for a whole image transfer (10 minutes)
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(600);

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Streams the bytes behind a URL into a sink
///
/// Transport problems must surface as [`Error::FetchFailed`]; failures
/// writing to the sink are local I/O errors. Implementations never retry.
pub trait Fetcher: Send + Sync {
    /// Returns the number of bytes written
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64>;
}

/// HTTP(S) fetcher backed by a blocking reqwest client
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests, body included, are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("isomgr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        info!("Downloading {}", url);

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| fetch_failed(url, classify(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_failed(url, FetchFailure::Http(status.as_u16())));
        }

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if is_body_timeout(&e) => {
                    return Err(fetch_failed(url, FetchFailure::Timeout));
                }
                Err(e) => {
                    return Err(fetch_failed(url, FetchFailure::Connection(e.to_string())));
                }
            };
            sink.write_all(&buf[..n]).map_err(|e| {
                Error::IoError(format!("Failed to write downloaded data: {}", e))
            })?;
            total += n as u64;
        }

        debug!("Downloaded {} bytes from {}", total, url);
        Ok(total)
    }
}

fn fetch_failed(url: &str, cause: FetchFailure) -> Error {
    Error::FetchFailed {
        url: url.to_string(),
        cause,
    }
}

fn classify(err: &reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Timeout
    } else if let Some(status) = err.status() {
        FetchFailure::Http(status.as_u16())
    } else {
        FetchFailure::Connection(err.to_string())
    }
}

// reqwest reports an expired deadline while reading the body as an io::Error
// wrapping its own timeout error
fn is_body_timeout(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}
