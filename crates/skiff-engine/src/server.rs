//! Server descriptors.

use serde::{Deserialize, Serialize};

/// Protocol family of a server, used for path syntax selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServerKind {
    #[default]
    Ftp,
    Sftp,
}

/// Per-server text encoding preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncodingPreference {
    /// Prefer UTF-8, fall back on decode failure.
    #[default]
    Auto,
    /// Force UTF-8; never fall back permanently.
    Utf8,
    /// A user-configured code page by WHATWG label, e.g. `"shift_jis"`.
    Custom(String),
}

/// Everything the engine needs to know about one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub kind: ServerKind,
    pub encoding: EncodingPreference,
    /// Connect directly even when a proxy is configured.
    pub bypass_proxy: bool,
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> ServerDescriptor {
        ServerDescriptor {
            host: host.into(),
            port,
            user: String::new(),
            password: String::new(),
            kind: ServerKind::default(),
            encoding: EncodingPreference::default(),
            bypass_proxy: false,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_kind(mut self, kind: ServerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_encoding(mut self, encoding: EncodingPreference) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_bypass_proxy(mut self, bypass: bool) -> Self {
        self.bypass_proxy = bypass;
        self
    }

    /// "host:port" for user-facing messages.
    pub fn format_host(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The identity used to decide whether two connections talk to the
    /// same server (lock scoping).
    pub fn key(&self) -> ServerKey {
        ServerKey {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }
}

/// Lock-scoping identity of a server: two connections conflict only when
/// host, port and user all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain_sets_fields() {
        let server = ServerDescriptor::new("ftp.example.com", 21)
            .with_user("anonymous", "guest")
            .with_kind(ServerKind::Sftp)
            .with_encoding(EncodingPreference::Custom("latin1".into()))
            .with_bypass_proxy(true);
        assert_eq!(server.port, 21);
        assert_eq!(server.user, "anonymous");
        assert_eq!(server.kind, ServerKind::Sftp);
        assert!(server.bypass_proxy);
    }

    #[test]
    fn key_ignores_password_and_kind() {
        let a = ServerDescriptor::new("h", 21).with_user("u", "secret1");
        let b = ServerDescriptor::new("h", 21).with_user("u", "secret2").with_kind(ServerKind::Sftp);
        assert_eq!(a.key(), b.key());

        let c = ServerDescriptor::new("h", 21).with_user("other", "x");
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn format_host_is_host_colon_port() {
        assert_eq!(ServerDescriptor::new("example.com", 2121).format_host(), "example.com:2121");
    }
}
