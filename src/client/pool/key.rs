use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// The URI used for reaching a server cannot be turned into a [`Target`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TargetError {
    /// The connection string could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The URI is missing a scheme.
    #[error("missing scheme in uri: {0}")]
    MissingScheme(http::Uri),

    /// Only `http` and `https` are spoken here.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The URI has no host to connect to.
    #[error("missing host in uri: {0}")]
    MissingHost(http::Uri),
}

/// URI schemes a connection can be made for.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Scheme {
    /// Plain text HTTP.
    Http,

    /// HTTP over TLS. The transport is responsible for the handshake.
    Https,
}

impl Scheme {
    /// The port used when a URI does not carry one.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// The scheme as it appears in a URI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool key which identifies the server a connection talks to.
///
/// Two requests share a connection only when their targets are equal,
/// which means scheme, host and port all match.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    host: Box<str>,
    port: u16,
}

impl Target {
    /// Create a target from its parts.
    pub fn new(scheme: Scheme, host: impl Into<Box<str>>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// The scheme of this target.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host name, as written in the URI. IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, with the scheme default applied.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The value of a `Host` header for this target.
    ///
    /// The port is omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&http::Uri> for Target {
    type Error = TargetError;

    fn try_from(uri: &http::Uri) -> Result<Self, Self::Error> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(s) => return Err(TargetError::UnsupportedScheme(s.to_owned())),
            None => return Err(TargetError::MissingScheme(uri.clone())),
        };

        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TargetError::MissingHost(uri.clone()))?;

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host.to_ascii_lowercase(), port))
    }
}

impl TryFrom<http::Uri> for Target {
    type Error = TargetError;

    fn try_from(uri: http::Uri) -> Result<Self, Self::Error> {
        Target::try_from(&uri)
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = http::Uri::from_str(s).map_err(|err| TargetError::InvalidUri(err.to_string()))?;
        uri.try_into()
    }
}

static CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a caller that pumps connections.
///
/// Connections are bound to one context at a time. A context must be used
/// by a single logical caller: the task or thread that submits requests
/// with it is the one expected to call `pump` with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Mint a new, unique context identity.
    pub fn new() -> Self {
        Self(CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[cfg(test)]
pub(crate) mod test_key {
    use super::*;

    #[test]
    fn target_from_uri() {
        let uri = http::Uri::from_static("http://localhost:8080/some/path");
        let target: Target = uri.try_into().unwrap();
        assert_eq!(target.scheme(), Scheme::Http);
        assert_eq!(target.host(), "localhost");
        assert_eq!(target.port(), 8080);
    }

    #[test]
    fn target_default_ports() {
        let target: Target = "http://example.com/".parse().unwrap();
        assert_eq!(target.port(), 80);
        assert_eq!(target.authority(), "example.com");

        let target: Target = "https://EXAMPLE.com".parse().unwrap();
        assert_eq!(target.port(), 443);
        assert_eq!(target.host(), "example.com");
    }

    #[test]
    fn target_display() {
        let target = Target::new(Scheme::Http, "localhost", 8080);
        assert_eq!(target.to_string(), "http://localhost:8080");
        assert_eq!(target.authority(), "localhost:8080");
    }

    #[test]
    fn target_errors() {
        assert!(matches!(
            "/relative".parse::<Target>(),
            Err(TargetError::MissingScheme(_))
        ));
        assert!(matches!(
            "ftp://example.com/".parse::<Target>(),
            Err(TargetError::UnsupportedScheme(s)) if s == "ftp"
        ));
    }

    #[test]
    fn context_ids_are_unique() {
        let a = ContextId::new();
        let b = ContextId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("ctx-"));
    }
}
