//! Bucket key derivation from request identity.

use std::fmt::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Result, TurnstileError};

/// Identity attributes the host extracts from an incoming request.
///
/// The limiter never inspects protocol-level request objects; adapters
/// implement this trait for whatever their framework hands them.
pub trait RequestIdentity {
    /// The network address the request originated from.
    fn source_address(&self) -> &str;

    /// The authenticated principal, if the request carries one.
    fn principal(&self) -> Option<&str>;
}

impl<T: RequestIdentity + ?Sized> RequestIdentity for &T {
    fn source_address(&self) -> &str {
        (**self).source_address()
    }

    fn principal(&self) -> Option<&str> {
        (**self).principal()
    }
}

/// An owned request identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Source address of the client
    pub address: String,
    /// Authenticated principal, absent for anonymous clients
    pub principal: Option<String>,
}

impl ClientIdentity {
    /// Create an anonymous identity for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            principal: None,
        }
    }

    /// Attach an authenticated principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr.to_string())
    }
}

/// The port is dropped: clients reconnecting from new ephemeral ports share a bucket.
impl From<SocketAddr> for ClientIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}

impl RequestIdentity for ClientIdentity {
    fn source_address(&self) -> &str {
        &self.address
    }

    fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

/// Which request attribute partitions the quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KeyMode {
    /// One bucket per source address
    #[default]
    ByAddress,
    /// One bucket per authenticated principal
    ByPrincipal,
}

impl KeyMode {
    /// Derive the bucket key for a request under this mode.
    pub fn derive_key<R: RequestIdentity + ?Sized>(
        &self,
        request: &R,
        scope: Option<&str>,
    ) -> Result<BucketKey> {
        let identity = match self {
            KeyMode::ByAddress => request.source_address(),
            KeyMode::ByPrincipal => request
                .principal()
                .ok_or(TurnstileError::MissingPrincipal)?,
        };

        Ok(match scope {
            Some(scope) => BucketKey::scoped(scope, identity),
            None => BucketKey::new(identity),
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            KeyMode::ByAddress => "by_address",
            KeyMode::ByPrincipal => "by_principal",
        }
    }
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyMode {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "by_address" | "address" | "ip" => Ok(KeyMode::ByAddress),
            "by_principal" | "principal" | "user" => Ok(KeyMode::ByPrincipal),
            _ => Err(TurnstileError::InvalidMode(s.to_string())),
        }
    }
}

/// Legacy numeric mode constants: `1` keys by address, `2` by principal.
impl TryFrom<u8> for KeyMode {
    type Error = TurnstileError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(KeyMode::ByAddress),
            2 => Ok(KeyMode::ByPrincipal),
            other => Err(TurnstileError::InvalidMode(other.to_string())),
        }
    }
}

/// A key that uniquely identifies a rate limit bucket in the counter store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Optional namespace isolating one protected operation's counters
    pub scope: Option<String>,
    /// The address or principal the bucket belongs to
    pub identity: String,
}

impl BucketKey {
    /// Create an unscoped key.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            scope: None,
            identity: identity.into(),
        }
    }

    /// Create a key namespaced under `scope`.
    pub fn scoped(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            identity: identity.into(),
        }
    }
}

/// Writes `part` with `\` and `:` backslash-escaped.
fn write_escaped(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    for c in part.chars() {
        if c == '\\' || c == ':' {
            f.write_char('\\')?;
        }
        f.write_char(c)?;
    }
    Ok(())
}

/// Renders `scope:identity`, or just `identity` when unscoped.
///
/// Backslashes and colons inside either part are escaped, so the only bare
/// `:` is the scope separator and distinct keys never render the same.
/// External stores may use this string as their key.
impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scope) = &self.scope {
            write_escaped(f, scope)?;
            f.write_char(':')?;
        }
        write_escaped(f, &self.identity)
    }
}
