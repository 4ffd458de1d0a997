//! Leasequery options from RFC 5007, plus the Relay-ID option from the bulk
//! leasequery extension (RFC 5460).

use core::net::Ipv6Addr;

use num_enum::TryFromPrimitive;

use crate::bytes::{BytesIn, BytesOut};
use crate::message::Message;
use crate::options::{parse_options, write_options, DhcpOption};
use crate::Error;

/// Query types from RFC 5007 (1-2) and RFC 5460 (3-5).
pub const QUERY_BY_ADDRESS: u8 = 1;
pub const QUERY_BY_CLIENT_ID: u8 = 2;
pub const QUERY_BY_RELAY_ID: u8 = 3;
pub const QUERY_BY_LINK_ADDRESS: u8 = 4;
pub const QUERY_BY_REMOTE_ID: u8 = 5;

/// The closed set of query types a server can implement. A query option
/// still parses with any type value; unrecognised types are answered with
/// an unknown-query-type status, so the open `u8` stays on the wire struct.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum QueryType {
    ByAddress = QUERY_BY_ADDRESS,
    ByClientId = QUERY_BY_CLIENT_ID,
    ByRelayId = QUERY_BY_RELAY_ID,
    ByLinkAddress = QUERY_BY_LINK_ADDRESS,
    ByRemoteId = QUERY_BY_REMOTE_ID,
}

/// The query carried in a Leasequery message: a query type, a link-address
/// scope (`::` for "all links") and the query-specific options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LqQueryOption {
    pub query_type: u8,
    pub link_address: Ipv6Addr,
    pub options: Vec<DhcpOption>,
}

impl LqQueryOption {
    pub fn new(query_type: u8, link_address: Ipv6Addr) -> Self {
        Self {
            query_type,
            link_address,
            options: Vec::new(),
        }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            query_type: bytes.byte()?,
            link_address: Ipv6Addr::from(bytes.arr::<16>()?),
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.byte(self.query_type).push(&self.link_address.octets());
        write_options(&self.options, out)
    }

    /// The query type, when it is one a server can know about.
    pub fn known_query_type(&self) -> Option<QueryType> {
        QueryType::try_from_primitive(self.query_type).ok()
    }

    pub fn query_type_name(&self) -> &'static str {
        match self.known_query_type() {
            Some(QueryType::ByAddress) => "query-by-address",
            Some(QueryType::ByClientId) => "query-by-client-id",
            Some(QueryType::ByRelayId) => "query-by-relay-id",
            Some(QueryType::ByLinkAddress) => "query-by-link-address",
            Some(QueryType::ByRemoteId) => "query-by-remote-id",
            None => "unknown",
        }
    }
}

/// All data for one client on one link inside a leasequery reply.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClientDataOption {
    pub options: Vec<DhcpOption>,
}

impl ClientDataOption {
    pub fn new(options: Vec<DhcpOption>) -> Self {
        Self { options }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        write_options(&self.options, out)
    }
}

/// The relay chain the server saw the last time the queried client talked to
/// it: the peer address of the outermost relay plus the stored relay-forward
/// message (with the client's own message removed).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LqRelayDataOption {
    pub peer_address: Ipv6Addr,
    pub relay_message: Box<Message>,
}

impl LqRelayDataOption {
    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        let peer_address = Ipv6Addr::from(bytes.arr::<16>()?);
        let relay_message = Message::parse(bytes.remaining())?;

        Ok(Self {
            peer_address,
            relay_message: Box::new(relay_message),
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.push(&self.peer_address.octets());
        self.relay_message.write(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::OPTION_LQ_QUERY;

    #[test]
    fn query_round_trip() {
        // query-by-address for 2001:db8::1, link unspecified, containing one
        // IAAddressOption
        let wire: Vec<u8> = vec![
            0x00, 0x2c, 0x00, 0x2d, // OPTION_LQ_QUERY, length 45
            0x01, // query-type 1
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, // link-address ::
            0x00, 0x05, 0x00, 0x18, // OPTION_IAADDR, length 24
            0x20, 0x01, 0x0d, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x01, // address
            0x00, 0x00, 0x01, 0x77, // preferred
            0x00, 0x00, 0x02, 0x58, // valid
        ];

        let mut bytes = BytesIn::new(&wire);
        let option = DhcpOption::parse(&mut bytes).unwrap();
        assert!(bytes.is_empty());

        let query = match &option {
            DhcpOption::LqQuery(query) => query,
            other => panic!("unexpected option {:?}", other),
        };
        assert_eq!(query.query_type, QUERY_BY_ADDRESS);
        assert_eq!(query.link_address, Ipv6Addr::UNSPECIFIED);
        assert_eq!(query.options.len(), 1);
        assert_eq!(option.code(), OPTION_LQ_QUERY);

        assert_eq!(option.save().unwrap(), wire);
    }

    #[test]
    fn truncated_query_fails() {
        // query-type present but link-address cut short
        let wire: Vec<u8> = vec![0x00, 0x2c, 0x00, 0x08, 0x01, 0, 0, 0, 0, 0, 0, 0];
        let mut bytes = BytesIn::new(&wire);
        assert_eq!(DhcpOption::parse(&mut bytes), Err(Error::LengthOverflow));
    }
}
