//! A broker between many concurrent callers and a BLE radio stack that only
//! tolerates one outstanding GATT procedure per connection.
//!
//! Native objects (connections, services, characteristics, descriptors and
//! remote devices talking to the local GATT server) are only ever referred to
//! through opaque, per-scope handles. Requests against a connection are
//! queued and submitted one at a time, completions are correlated back to the
//! right caller, and unsolicited events (notifications, server requests,
//! connection state changes) are routed to long-lived streams.
//!
//! Everything hangs off a [`session::Session`] created from a
//! [`session::SessionConfig`] with a [`backend::Radio`] implementation.

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod uuid;

mod handle;
use handle::define_handle;
pub use handle::{Handle, HandleTable};

mod reply;
pub use reply::Reply;

pub mod attribute;
pub mod backend;

mod queue;
mod notify;
mod connection;

pub mod server;
pub mod advertise;

pub mod session;

pub mod fake;

#[cfg(test)]
mod tests;

pub use backend::{ConnectionState, GattStatus};

define_handle!(
    /// Identifies an open central-role connection within a session
    ConnectionHandle,
    "connection"
);

define_handle!(
    /// Identifies a service, characteristic or descriptor within one
    /// connection's current discovery generation
    AttributeHandle,
    "attribute"
);

define_handle!(
    /// Identifies a remote central connected to the local GATT server
    DeviceHandle,
    "device"
);

/// A caller-chosen value attached to a server attribute.
///
/// Routing handles are never allocated by the server, they're simply echoed
/// back in read/write events so the caller can dispatch without a second
/// lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingHandle(pub u32);

impl fmt::Display for RoutingHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// The address of a remote device as understood by the native stack
///
/// Addresses that parse as 48-bit MACs are normalized (so two spellings of
/// the same MAC compare equal), anything else is kept as an opaque string.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "{}", mac),
            Address::String(s) => write!(f, "{}", s),
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "MAC:{}", mac),
            Address::String(s) => write!(f, "String:{}", s),
        }
    }
}

// No allocations on the failure path: plenty of valid addresses aren't MACs
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        parts.try_push(part).ok()?;
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (byte, part) in bytes.iter_mut().zip(parts.iter()) {
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl Address {
    /// Whether the native stack could possibly resolve this address. Only
    /// an empty (or all whitespace) string is rejected up front.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Address::String(s) if s.trim().is_empty() => Err(Error::InvalidArgument("Empty address".to_string())),
            _ => Ok(()),
        }
    }
}

impl FromStr for Address {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let address = match try_u64_from_mac48_str(s) {
            Some(val) => Address::MAC(MAC(val)),
            None => Address::String(s.to_string()),
        };
        address.validate()?;
        Ok(address)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown {0} handle")]
    NotFound(&'static str),

    #[error("A {0} request is already outstanding")]
    AlreadyPending(&'static str),

    #[error("The native stack rejected the {0} request")]
    SubmitFailed(&'static str),

    #[error("The native stack reported failure (status = {0:#x})")]
    NativeFailure(i32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("The radio doesn't support this request / operation")]
    Unsupported,

    #[error("The connection or server was closed before the request completed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<::uuid::Error> for Error {
    fn from(err: ::uuid::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Closed
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn mac_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    // Octets are formatted as uppercase since Android insists on that
    assert_eq!(addr.to_string(), "F1:E2:D3:C4:B5:A6");
    assert_eq!(Address::from_str("f1:e2:d3:c4:b5:a6").unwrap(), addr);

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    assert_eq!(addr.to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");

    assert!(matches!(Address::from_str("F1:E2:D3:C4:B5").unwrap(), Address::String(_)));
    assert!(matches!(Address::from_str("F1:E2:D3:C4:B5:A6:07").unwrap(), Address::String(_)));
}

#[test]
fn empty_address_is_invalid() {
    assert!(matches!(Address::from_str(""), Err(Error::InvalidArgument(_))));
    assert!(matches!(Address::from_str("  "), Err(Error::InvalidArgument(_))));
    assert!(matches!(Address::String(String::new()).validate(), Err(Error::InvalidArgument(_))));
    assert!(Address::MAC(MAC(0)).validate().is_ok());
}

#[test]
fn handles_reject_zero() {
    assert!(ConnectionHandle::new(0).is_none());
    assert_eq!(AttributeHandle::new(3).map(|h| h.get()), Some(3));
    assert_eq!(serde_json::to_string(&DeviceHandle::new(9).unwrap()).unwrap(), "9");
}
