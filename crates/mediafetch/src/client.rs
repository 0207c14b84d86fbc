use std::sync::OnceLock;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info};

use crate::config::HttpConfig;
use crate::error::EngineError;
use crate::proxy::build_proxy_from_config;

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Convert string pairs into a [`HeaderMap`], rejecting invalid names or values.
pub fn header_map<'a, I>(headers: I) -> Result<HeaderMap, EngineError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EngineError::configuration(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            EngineError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Create the shared reqwest client used by every fetcher.
pub fn create_client(config: &HttpConfig) -> Result<Client, EngineError> {
    install_rustls_provider();

    let mut client_builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(header_map(&config.headers)?)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout())
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout().is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout());
    }

    if let Some(proxy_config) = &config.proxy {
        let proxy = build_proxy_from_config(proxy_config)?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy for downloads");
    } else if config.use_system_proxy {
        // reqwest uses system proxy settings unless no_proxy() is called
        debug!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    client_builder.build().map_err(EngineError::from)
}
