//! Engine options consumed by the operation core.

use serde::{Deserialize, Serialize};

/// Proxy flavor for the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProxyType {
    #[default]
    None,
    Http,
    Socks4,
    Socks5,
}

/// Proxy connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyOptions {
    pub kind: ProxyType,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub pass: String,
}

impl ProxyOptions {
    /// Whether a usable proxy is configured.
    pub fn enabled(&self) -> bool {
        self.kind != ProxyType::None && !self.host.is_empty() && self.port != 0
    }
}

/// Options read by the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Command timeout in seconds; `0` disables the watchdog.
    pub timeout_secs: u64,
    pub proxy: ProxyOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            timeout_secs: skiff_core::constants::DEFAULT_TIMEOUT_SECS,
            proxy: ProxyOptions::default(),
        }
    }
}

impl EngineOptions {
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = proxy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_nonzero() {
        assert!(EngineOptions::default().timeout_secs > 0);
    }

    #[test]
    fn proxy_disabled_without_host() {
        let proxy = ProxyOptions { kind: ProxyType::Socks5, ..Default::default() };
        assert!(!proxy.enabled());

        let proxy = ProxyOptions {
            kind: ProxyType::Socks5,
            host: "proxy.local".into(),
            port: 1080,
            ..Default::default()
        };
        assert!(proxy.enabled());
    }

    #[test]
    fn proxy_none_is_never_enabled() {
        let proxy = ProxyOptions {
            kind: ProxyType::None,
            host: "proxy.local".into(),
            port: 1080,
            ..Default::default()
        };
        assert!(!proxy.enabled());
    }
}
