use crate::transport::proxied_http_client;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// URL fetched to confirm that a transport reaches the internet
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Active connectivity test through a transport's SOCKS5 endpoint
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, bind_addr: &str) -> Result<()>;
}

/// GET a well known URL through the endpoint and expect a 2xx answer.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        HttpProbe {
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        HttpProbe::new(DEFAULT_PROBE_URL, Duration::from_secs(10))
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, bind_addr: &str) -> Result<()> {
        let client = proxied_http_client(bind_addr, self.timeout)?;
        let request = async {
            let response = client.get(&self.url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::http(format!("probe returned {}", status)));
            }
            response.bytes().await?;
            Ok::<(), Error>(())
        };

        timeout(self.timeout, request)
            .await
            .map_err(|_| Error::timeout(format!("probe via {} timed out", bind_addr)))??;
        debug!("probe via {} succeeded", bind_addr);
        Ok(())
    }
}
