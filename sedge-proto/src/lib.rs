//! DHCPv6 wire codec.
//!
//! Everything that can appear on the wire is an element: messages, options,
//! DUIDs and NTP sub-options. Elements parse from byte buffers, serialise
//! back to the exact same bytes, compare by value, and render both as
//! indented text and as JSON. Which concrete element a type code maps to is
//! decided by the [`registry`] tables; the [`grammar`] module holds the
//! containment rules (`validate()` only, parsing is deliberately lenient so
//! rule-breaking packets can still be inspected).
//!
//! Call [`load_all_extensions`] once during process startup, before the
//! first parse.

use core::fmt;

pub mod bytes;
pub mod duid;
pub mod grammar;
pub mod message;
pub mod name;
pub mod options;
pub mod registry;
pub mod repr;

pub use duid::Duid;
pub use message::{ClientServerMessage, Message, MessageType, RelayMessage, TransactionId};
pub use name::DomainName;
pub use options::DhcpOption;

/// The server/relay port (RFC 8415 section 7.2).
pub const SERVER_PORT: u16 = 547;
/// The client port.
pub const CLIENT_PORT: u16 = 546;

/// All_DHCP_Relay_Agents_and_Servers (ff02::1:2).
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: core::net::Ipv6Addr =
    core::net::Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x0001, 0x0002);

/// The value lifetimes use for "infinity" (RFC 8415 section 7.7).
pub const INFINITY: u32 = 0xffff_ffff;

/// Populate every element registry and the containment grammar.
///
/// Idempotent; parsing also triggers the registries lazily, but a process
/// should call this up front so the first packet does not pay for the build
/// and so configuration code can resolve element names immediately.
pub fn load_all_extensions() {
    let _ = registry::options();
    let _ = registry::messages();
    let _ = registry::duids();
    let _ = registry::ntp_suboptions();
    let _ = grammar::table();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A declared length reaches past the end of the available buffer.
    LengthOverflow,
    /// A fixed- or structured-length field does not have the length it must.
    InvalidLength(&'static str),
    /// A domain-name label is too long or not alphanumeric.
    BadLabel,
    /// A domain name without a terminating zero-length label.
    Unterminated,
    /// A field holds a value the protocol reserves.
    ReservedValue(&'static str),
    /// A bounded-length field exceeds its maximum.
    TooLong { element: &'static str, max: usize },
    /// An element contains a child its grammar does not allow at all.
    MayNotContain {
        parent: &'static str,
        child: &'static str,
    },
    /// An occurrence count outside the grammar's `(min, max)` bounds.
    Containment {
        parent: &'static str,
        child: &'static str,
        count: usize,
        min: u32,
        max: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthOverflow => write!(f, "declared length exceeds the available buffer"),
            Self::InvalidLength(element) => write!(f, "invalid length for {}", element),
            Self::BadLabel => write!(f, "invalid domain name label"),
            Self::Unterminated => write!(f, "domain name misses its terminating zero label"),
            Self::ReservedValue(element) => write!(f, "reserved value in {}", element),
            Self::TooLong { element, max } => {
                write!(f, "{} may be at most {} bytes", element, max)
            }
            Self::MayNotContain { parent, child } => {
                write!(f, "{} may not contain {}", parent, child)
            }
            Self::Containment {
                parent,
                child,
                count,
                min,
                max,
            } => {
                if count < &(*min as usize) {
                    write!(f, "{} must contain at least {} {}", parent, min, child)
                } else {
                    write!(
                        f,
                        "{} may contain at most {} {} (found {})",
                        parent, max, child, count
                    )
                }
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extension_loading_is_idempotent() {
        load_all_extensions();
        load_all_extensions();
        assert!(registry::options().is_known(options::OPTION_LQ_QUERY));
        assert!(registry::ntp_suboptions().decoder(1).is_some());
    }

    #[test]
    fn multicast_address_constant() {
        assert_eq!(
            ALL_DHCP_RELAY_AGENTS_AND_SERVERS.to_string(),
            "ff02::1:2"
        );
    }
}
