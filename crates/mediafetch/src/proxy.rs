use reqwest::Proxy;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

/// Proxy authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

/// Build a reqwest Proxy object from our proxy configuration
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, EngineError> {
    let proxy_url = &config.url;

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(proxy_url).map_err(|e| {
            EngineError::configuration(format!("invalid HTTP proxy URL `{proxy_url}`: {e}"))
        })?,
        ProxyType::Https => Proxy::https(proxy_url).map_err(|e| {
            EngineError::configuration(format!("invalid HTTPS proxy URL `{proxy_url}`: {e}"))
        })?,
        ProxyType::Socks5 => {
            // reqwest wants an explicit socks5:// or socks5h:// scheme
            let url = if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            };

            Proxy::all(&url).map_err(|e| {
                EngineError::configuration(format!("invalid SOCKS5 proxy URL `{url}`: {e}"))
            })?
        }
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_scheme_is_added() {
        let config = ProxyConfig {
            url: "127.0.0.1:1080".to_string(),
            proxy_type: ProxyType::Socks5,
            auth: Some(ProxyAuth {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
        };
        assert!(build_proxy_from_config(&config).is_ok());
    }

    #[test]
    fn invalid_http_proxy_is_a_configuration_error() {
        let config = ProxyConfig {
            url: "http://[::1".to_string(),
            proxy_type: ProxyType::Http,
            auth: None,
        };
        assert!(matches!(
            build_proxy_from_config(&config),
            Err(EngineError::Configuration { .. })
        ));
    }
}
