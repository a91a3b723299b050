use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Method, Proxy, Url};

use crawl_common::{Error, Fetcher, Request, Result};

use crate::useragent;

/// Browser-imitating fetcher: per-request random user agent, optional
/// round-robin proxies, task cookie header, charset-aware UTF-8 decode.
pub struct BrowserFetcher {
    client: reqwest::Client,
}

pub struct BrowserFetcherBuilder {
    timeout: Duration,
    proxies: Vec<String>,
}

impl Default for BrowserFetcherBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            proxies: Vec::new(),
        }
    }
}

impl BrowserFetcherBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn build(self) -> Result<BrowserFetcher> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);

        if !self.proxies.is_empty() {
            let urls = self
                .proxies
                .iter()
                .map(|p| Url::parse(p))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Config(format!("invalid proxy url: {e}")))?;
            let cursor = Arc::new(AtomicUsize::new(0));
            builder = builder.proxy(Proxy::custom(move |_url| {
                let next = cursor.fetch_add(1, Ordering::Relaxed) % urls.len();
                Some(urls[next].clone())
            }));
        }

        let client = builder
            .build()
            .map_err(|e| Error::Fetch(Box::new(e)))?;
        Ok(BrowserFetcher { client })
    }
}

impl BrowserFetcher {
    pub fn builder() -> BrowserFetcherBuilder {
        BrowserFetcherBuilder::default()
    }
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    async fn get(&self, request: &Request, cookie: &str) -> Result<Bytes> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::Fetch(Box::new(e)))?;

        let mut req = self
            .client
            .request(method, &request.url)
            .header(header::USER_AGENT, useragent::random());
        if !cookie.is_empty() {
            req = req.header(header::COOKIE, cookie);
        }

        let resp = req.send().await.map_err(|e| Error::Fetch(Box::new(e)))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| Error::Fetch(Box::new(e)))?;

        // `text` decodes to UTF-8 using the response charset.
        let body = resp.text().await.map_err(|e| Error::Fetch(Box::new(e)))?;
        Ok(Bytes::from(body))
    }
}
