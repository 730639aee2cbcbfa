use std::borrow::Borrow;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::KeyError;

/// Keys longer than this are rejected as malformed.
pub const MAX_KEY_LEN: usize = 512;

const UNKNOWN: &str = "unknown";
const GLOBAL: &str = "global";

/// An opaque, immutable partition key (client identity, route, ...).
///
/// Cloning is cheap: the bytes are shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(Arc<str>);

impl RateLimitKey {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, KeyError> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong { len: raw.len() });
        }
        if raw.chars().any(|c| c.is_ascii_control()) {
            return Err(KeyError::ControlCharacter);
        }
        Ok(Self(Arc::from(raw)))
    }

    /// Validates `raw`, falling back to the shared `"unknown"` key.
    ///
    /// A malformed key is a caller bug; it is logged and the request is
    /// accounted against the fallback key instead of being waved through.
    pub fn or_unknown(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref();
        match Self::new(raw) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(%error, len = raw.len(), "malformed admission key, using fallback");
                Self::unknown()
            }
        }
    }

    pub fn unknown() -> Self {
        Self(Arc::from(UNKNOWN))
    }

    pub fn global() -> Self {
        Self(Arc::from(GLOBAL))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RateLimitKey").field(&&*self.0).finish()
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RateLimitKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for RateLimitKey {
    type Error = KeyError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl TryFrom<String> for RateLimitKey {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

/// What the boundary layer knows about an incoming request.
///
/// Only the fields needed for key derivation and path policies are kept;
/// header parsing happens before this is built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub peer_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` header value.
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` header value.
    pub real_ip: Option<String>,
    pub api_key: Option<String>,
    pub user_id: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    pub fn with_api_key(mut self, value: impl Into<String>) -> Self {
        self.api_key = Some(value.into());
        self
    }

    pub fn with_user_id(mut self, value: impl Into<String>) -> Self {
        self.user_id = Some(value.into());
        self
    }

    /// The originating client address.
    ///
    /// Prefers the first `X-Forwarded-For` hop, then `X-Real-IP`, then the
    /// socket peer.
    pub fn client_ip(&self) -> String {
        if let Some(first) = self
            .forwarded_for
            .as_deref()
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
        {
            return first.to_string();
        }
        if let Some(real_ip) = self.real_ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) {
            return real_ip.to_string();
        }
        self.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// `METHOD:path`, the per-endpoint circuit key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.method, self.path)
    }
}

/// Maps a request to the partition key its state is accounted under.
///
/// Implementations must be pure: the same request always yields the same key.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, request: &RequestDescriptor) -> String;

    /// Extracts and validates, substituting the fallback key when malformed.
    fn key(&self, request: &RequestDescriptor) -> RateLimitKey {
        RateLimitKey::or_unknown(self.extract(request))
    }
}

impl<F> KeyExtractor for F
where
    F: Fn(&RequestDescriptor) -> String + Send + Sync,
{
    fn extract(&self, request: &RequestDescriptor) -> String {
        self(request)
    }
}

/// The built-in key derivation policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One shared partition for every request.
    Global,
    /// Client address only.
    ClientIp,
    /// `client:METHOD:path`.
    #[default]
    ClientRoute,
    /// Request path only.
    Path,
    /// `METHOD:path`.
    Endpoint,
    /// API key, falling back to the client address.
    ApiKey,
    /// Authenticated user id, falling back to the client address.
    UserId,
}

impl KeyExtractor for KeyStrategy {
    fn extract(&self, request: &RequestDescriptor) -> String {
        match self {
            Self::Global => GLOBAL.to_string(),
            Self::ClientIp => request.client_ip(),
            Self::ClientRoute => format!(
                "{}:{}:{}",
                request.client_ip(),
                request.method,
                request.path
            ),
            Self::Path => request.path.clone(),
            Self::Endpoint => request.endpoint(),
            Self::ApiKey => match &request.api_key {
                Some(api_key) if !api_key.is_empty() => format!("key:{api_key}"),
                _ => request.client_ip(),
            },
            Self::UserId => match &request.user_id {
                Some(user_id) if !user_id.is_empty() => format!("user:{user_id}"),
                _ => request.client_ip(),
            },
        }
    }
}
