//! DHCPv6 messages.
//!
//! Two wire families exist: client/server messages (type, 3-byte
//! transaction-id, options) and relay messages (type, hop count, link and
//! peer address, options). A relay chain is a relay-forward message whose
//! relay-message option carries either a deeper relay-forward or the client
//! message itself; recursion depth is naturally bounded by the 8-bit hop
//! count, so parsing needs no extra depth limit.

use core::net::Ipv6Addr;

use log::debug;

use crate::bytes::{BytesIn, BytesOut};
use crate::duid::Duid;
use crate::options::{
    parse_options, write_options, DhcpOption, LqQueryOption, StatusCodeOption, OPTION_CLIENTID,
    OPTION_ELAPSED_TIME, OPTION_INTERFACE_ID, OPTION_LQ_QUERY, OPTION_ORO, OPTION_RAPID_COMMIT,
    OPTION_SERVERID, OPTION_STATUS_CODE,
};
use crate::registry;
use crate::Error;

pub const MSG_SOLICIT: u8 = 1;
pub const MSG_ADVERTISE: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_CONFIRM: u8 = 4;
pub const MSG_RENEW: u8 = 5;
pub const MSG_REBIND: u8 = 6;
pub const MSG_REPLY: u8 = 7;
pub const MSG_RELEASE: u8 = 8;
pub const MSG_DECLINE: u8 = 9;
pub const MSG_RECONFIGURE: u8 = 10;
pub const MSG_INFORMATION_REQUEST: u8 = 11;
pub const MSG_RELAY_FORW: u8 = 12;
pub const MSG_RELAY_REPL: u8 = 13;
pub const MSG_LEASEQUERY: u8 = 14;
pub const MSG_LEASEQUERY_REPLY: u8 = 15;
pub const MSG_LEASEQUERY_DONE: u8 = 16;
pub const MSG_LEASEQUERY_DATA: u8 = 17;

pub type TransactionId = [u8; 3];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Solicit,
    Advertise,
    Request,
    Confirm,
    Renew,
    Rebind,
    Reply,
    Release,
    Decline,
    Reconfigure,
    InformationRequest,
    RelayForward,
    RelayReply,
    Leasequery,
    LeasequeryReply,
    LeasequeryDone,
    LeasequeryData,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(code: u8) -> Self {
        use MessageType::*;

        match code {
            MSG_SOLICIT => Solicit,
            MSG_ADVERTISE => Advertise,
            MSG_REQUEST => Request,
            MSG_CONFIRM => Confirm,
            MSG_RENEW => Renew,
            MSG_REBIND => Rebind,
            MSG_REPLY => Reply,
            MSG_RELEASE => Release,
            MSG_DECLINE => Decline,
            MSG_RECONFIGURE => Reconfigure,
            MSG_INFORMATION_REQUEST => InformationRequest,
            MSG_RELAY_FORW => RelayForward,
            MSG_RELAY_REPL => RelayReply,
            MSG_LEASEQUERY => Leasequery,
            MSG_LEASEQUERY_REPLY => LeasequeryReply,
            MSG_LEASEQUERY_DONE => LeasequeryDone,
            MSG_LEASEQUERY_DATA => LeasequeryData,
            code => Unknown(code),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(message_type: MessageType) -> Self {
        use MessageType::*;

        match message_type {
            Solicit => MSG_SOLICIT,
            Advertise => MSG_ADVERTISE,
            Request => MSG_REQUEST,
            Confirm => MSG_CONFIRM,
            Renew => MSG_RENEW,
            Rebind => MSG_REBIND,
            Reply => MSG_REPLY,
            Release => MSG_RELEASE,
            Decline => MSG_DECLINE,
            Reconfigure => MSG_RECONFIGURE,
            InformationRequest => MSG_INFORMATION_REQUEST,
            RelayForward => MSG_RELAY_FORW,
            RelayReply => MSG_RELAY_REPL,
            Leasequery => MSG_LEASEQUERY,
            LeasequeryReply => MSG_LEASEQUERY_REPLY,
            LeasequeryDone => MSG_LEASEQUERY_DONE,
            LeasequeryData => MSG_LEASEQUERY_DATA,
            Unknown(code) => code,
        }
    }
}

impl MessageType {
    pub fn is_relay(self) -> bool {
        matches!(self, Self::RelayForward | Self::RelayReply)
    }

    /// Whether a server may legitimately receive this message type.
    pub fn from_client_to_server(self) -> bool {
        use MessageType::*;

        matches!(
            self,
            Solicit
                | Request
                | Confirm
                | Renew
                | Rebind
                | Release
                | Decline
                | InformationRequest
                | RelayForward
                | Leasequery
        )
    }

    /// Whether a server may legitimately send this message type.
    pub fn from_server_to_client(self) -> bool {
        use MessageType::*;

        matches!(
            self,
            Advertise
                | Reply
                | Reconfigure
                | RelayReply
                | LeasequeryReply
                | LeasequeryDone
                | LeasequeryData
        )
    }

    pub fn class_name(self) -> &'static str {
        registry::messages()
            .name(u8::from(self))
            .unwrap_or("UnknownMessage")
    }
}

/// The client/server message family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientServerMessage {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub options: Vec<DhcpOption>,
}

impl ClientServerMessage {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            options: Vec::new(),
        }
    }

    fn parse_body(message_type: MessageType, bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            message_type,
            transaction_id: bytes.arr()?,
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.byte(self.message_type.into()).push(&self.transaction_id);
        write_options(&self.options, out)
    }

    pub fn options_of_code(&self, code: u16) -> impl Iterator<Item = &DhcpOption> {
        self.options.iter().filter(move |option| option.code() == code)
    }

    pub fn option_of_code(&self, code: u16) -> Option<&DhcpOption> {
        self.options_of_code(code).next()
    }

    pub fn client_id(&self) -> Option<&Duid> {
        match self.option_of_code(OPTION_CLIENTID) {
            Some(DhcpOption::ClientId(duid)) => Some(duid),
            _ => None,
        }
    }

    pub fn server_id(&self) -> Option<&Duid> {
        match self.option_of_code(OPTION_SERVERID) {
            Some(DhcpOption::ServerId(duid)) => Some(duid),
            _ => None,
        }
    }

    pub fn option_request(&self) -> Option<&[u16]> {
        match self.option_of_code(OPTION_ORO) {
            Some(DhcpOption::OptionRequest(codes)) => Some(codes),
            _ => None,
        }
    }

    /// Elapsed time in 1/100 s, if the client sent one.
    pub fn elapsed_time(&self) -> Option<u16> {
        match self.option_of_code(OPTION_ELAPSED_TIME) {
            Some(DhcpOption::ElapsedTime(time)) => Some(*time),
            _ => None,
        }
    }

    pub fn has_rapid_commit(&self) -> bool {
        self.option_of_code(OPTION_RAPID_COMMIT).is_some()
    }

    pub fn status_code(&self) -> Option<&StatusCodeOption> {
        match self.option_of_code(OPTION_STATUS_CODE) {
            Some(DhcpOption::StatusCode(status)) => Some(status),
            _ => None,
        }
    }

    pub fn lq_query(&self) -> Option<&LqQueryOption> {
        match self.option_of_code(OPTION_LQ_QUERY) {
            Some(DhcpOption::LqQuery(query)) => Some(query),
            _ => None,
        }
    }

    pub fn interface_id(&self) -> Option<&[u8]> {
        match self.option_of_code(OPTION_INTERFACE_ID) {
            Some(DhcpOption::InterfaceId(interface_id)) => Some(interface_id),
            _ => None,
        }
    }

    /// The IA options (IA_NA, IA_TA, IA_PD) of this message.
    pub fn ia_options(&self) -> impl Iterator<Item = &DhcpOption> {
        self.options.iter().filter(|option| {
            matches!(
                option,
                DhcpOption::IaNa(_) | DhcpOption::IaTa(_) | DhcpOption::IaPd(_)
            )
        })
    }
}

/// The relay message family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayMessage {
    pub message_type: MessageType,
    pub hop_count: u8,
    pub link_address: Ipv6Addr,
    pub peer_address: Ipv6Addr,
    pub options: Vec<DhcpOption>,
}

impl RelayMessage {
    fn parse_body(message_type: MessageType, bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            message_type,
            hop_count: bytes.byte()?,
            link_address: Ipv6Addr::from(bytes.arr::<16>()?),
            peer_address: Ipv6Addr::from(bytes.arr::<16>()?),
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.byte(self.message_type.into())
            .byte(self.hop_count)
            .push(&self.link_address.octets())
            .push(&self.peer_address.octets());
        write_options(&self.options, out)
    }

    pub fn options_of_code(&self, code: u16) -> impl Iterator<Item = &DhcpOption> {
        self.options.iter().filter(move |option| option.code() == code)
    }

    pub fn option_of_code(&self, code: u16) -> Option<&DhcpOption> {
        self.options_of_code(code).next()
    }

    /// The message this relay message wraps, if present.
    pub fn relayed_message(&self) -> Option<&Message> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RelayMessage(message) => Some(message.as_ref()),
            _ => None,
        })
    }

    pub fn relayed_message_mut(&mut self) -> Option<&mut Message> {
        self.options.iter_mut().find_map(|option| match option {
            DhcpOption::RelayMessage(message) => Some(message.as_mut()),
            _ => None,
        })
    }

    /// Replace the wrapped message, installing a relay-message option when
    /// none exists yet.
    pub fn set_relayed_message(&mut self, message: Message) {
        match self.relayed_message_mut() {
            Some(slot) => *slot = message,
            None => self
                .options
                .push(DhcpOption::RelayMessage(Box::new(message))),
        }
    }

    pub fn interface_id(&self) -> Option<&[u8]> {
        match self.option_of_code(OPTION_INTERFACE_ID) {
            Some(DhcpOption::InterfaceId(interface_id)) => Some(interface_id),
            _ => None,
        }
    }
}

/// A message of a type nobody recognises; kept as raw payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownMessage {
    pub message_type: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ClientServer(ClientServerMessage),
    Relay(RelayMessage),
    Unknown(UnknownMessage),
}

impl Message {
    /// Parse a message from the whole of `data`.
    ///
    /// Messages have no internal length field; they always extend to the end
    /// of their container (a datagram, a TCP frame, a relay-message option).
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);
        let code = bytes.byte()?;
        let message_type = MessageType::from(code);

        if message_type.is_relay() {
            return Ok(Self::Relay(RelayMessage::parse_body(message_type, &mut bytes)?));
        }

        if registry::messages().is_known(code) {
            Ok(Self::ClientServer(ClientServerMessage::parse_body(
                message_type,
                &mut bytes,
            )?))
        } else {
            debug!("Keeping message of unknown type {} as raw data", code);
            Ok(Self::Unknown(UnknownMessage {
                message_type: code,
                data: bytes.remaining().to_vec(),
            }))
        }
    }

    pub fn write(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        match self {
            Self::ClientServer(message) => message.write(out),
            Self::Relay(message) => message.write(out),
            Self::Unknown(message) => {
                out.byte(message.message_type).push(&message.data);
                Ok(())
            }
        }
    }

    pub fn save(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        self.write(&mut BytesOut::new(&mut buf))?;
        Ok(buf)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ClientServer(message) => message.message_type,
            Self::Relay(message) => message.message_type,
            Self::Unknown(message) => MessageType::Unknown(message.message_type),
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Unknown(_) => "UnknownMessage",
            _ => self.message_type().class_name(),
        }
    }

    pub fn as_client_server(&self) -> Option<&ClientServerMessage> {
        match self {
            Self::ClientServer(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_client_server_mut(&mut self) -> Option<&mut ClientServerMessage> {
        match self {
            Self::ClientServer(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_relay(&self) -> Option<&RelayMessage> {
        match self {
            Self::Relay(message) => Some(message),
            _ => None,
        }
    }

    pub fn options(&self) -> &[DhcpOption] {
        match self {
            Self::ClientServer(message) => &message.options,
            Self::Relay(message) => &message.options,
            Self::Unknown(_) => &[],
        }
    }

    /// Containment and field validation over the whole element tree.
    pub fn validate(&self) -> Result<(), Error> {
        crate::grammar::validate_message(self)?;

        for option in self.options() {
            option.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(wire: &[u8]) -> Message {
        let message = Message::parse(wire).unwrap();
        assert_eq!(message.save().unwrap(), wire);
        message
    }

    #[test]
    fn solicit() {
        let wire: Vec<u8> = vec![
            0x01, 0x10, 0x08, 0x74, 0x00, 0x01, 0x00, 0x0e, 0x00, 0x01, 0x00, 0x01, 0x1c, 0x39,
            0xcf, 0x88, 0x08, 0x00, 0x27, 0xfe, 0x8f, 0x95, 0x00, 0x06, 0x00, 0x04, 0x00, 0x17,
            0x00, 0x18, 0x00, 0x08, 0x00, 0x02, 0x00, 0x00, 0x00, 0x19, 0x00, 0x0c, 0x27, 0xfe,
            0x8f, 0x95, 0x00, 0x00, 0x0e, 0x10, 0x00, 0x00, 0x15, 0x18,
        ];
        let message = round_trip(&wire);
        assert_eq!(message.message_type(), MessageType::Solicit);

        let message = message.as_client_server().unwrap();
        assert_eq!(message.transaction_id, [0x10, 0x08, 0x74]);
        assert_eq!(message.option_request(), Some(&[0x17, 0x18][..]));
        assert_eq!(message.elapsed_time(), Some(0));
        assert!(message.client_id().is_some());
        assert!(message.server_id().is_none());
    }

    #[test]
    fn advertise() {
        let wire: Vec<u8> = vec![
            0x02, 0x10, 0x08, 0x74, 0x00, 0x19, 0x00, 0x29, 0x27, 0xfe, 0x8f, 0x95, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x19, 0x00, 0x00, 0x11, 0x94,
            0x00, 0x00, 0x1c, 0x20, 0x40, 0x20, 0x01, 0x00, 0x00, 0x00, 0x00, 0xfe, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x0e, 0x00, 0x01, 0x00,
            0x01, 0x1c, 0x39, 0xcf, 0x88, 0x08, 0x00, 0x27, 0xfe, 0x8f, 0x95, 0x00, 0x02, 0x00,
            0x0e, 0x00, 0x01, 0x00, 0x01, 0x1c, 0x38, 0x25, 0xe8, 0x08, 0x00, 0x27, 0xd4, 0x10,
            0xbb,
        ];
        let message = round_trip(&wire);
        assert_eq!(message.message_type(), MessageType::Advertise);

        let message = message.as_client_server().unwrap();
        match message.option_of_code(crate::options::OPTION_IA_PD) {
            Some(DhcpOption::IaPd(ia)) => {
                let prefixes: Vec<_> = ia.prefixes().collect();
                assert_eq!(prefixes.len(), 1);
                assert_eq!(prefixes[0].prefix_length, 64);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn relay_forward_chain() {
        // A relay-forward wrapping a solicit, with an interface-id on the hop
        let inner: Vec<u8> = vec![
            0x01, 0xf3, 0x50, 0xd6, // solicit
            0x00, 0x01, 0x00, 0x0a, 0x00, 0x03, 0x00, 0x01, 0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1,
        ];

        let mut wire: Vec<u8> = vec![0x0c, 0x01];
        wire.extend_from_slice(&"2001:db8:ffff:1::1".parse::<Ipv6Addr>().unwrap().octets());
        wire.extend_from_slice(&"fe80::3631:c4ff:fe3c:b2f1".parse::<Ipv6Addr>().unwrap().octets());
        wire.extend_from_slice(&[0x00, 0x12, 0x00, 0x05]); // interface-id "eth0 "
        wire.extend_from_slice(b"eth0 ");
        wire.extend_from_slice(&[0x00, 0x09, 0x00, 0x12]); // relay-message
        wire.extend_from_slice(&inner);

        let message = round_trip(&wire);
        let relay = message.as_relay().unwrap();
        assert_eq!(relay.hop_count, 1);
        assert_eq!(relay.interface_id(), Some(&b"eth0 "[..]));

        let relayed = relay.relayed_message().unwrap();
        assert_eq!(relayed.message_type(), MessageType::Solicit);
    }

    #[test]
    fn leasequery_by_address() {
        let wire: Vec<u8> = vec![
            0x0e, // leasequery
            0xe8, 0x6f, 0x0c, // transaction id
            0x00, 0x01, 0x00, 0x0a, // client-id, length 10
            0x00, 0x03, 0x00, 0x01, 0x00, 0x1e, 0xe6, 0xf7, 0x7d, 0x00, //
            0x00, 0x2c, 0x00, 0x17, // lq-query, length 23
            0x01, // query-by-address
            0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, // fe80::1
            0x00, 0x06, 0x00, 0x02, 0x00, 0x2f, // ORO asking for lq-relay-data
        ];

        let parsed = round_trip(&wire);
        assert_eq!(parsed.message_type(), MessageType::Leasequery);
        parsed.validate().unwrap();

        let message = parsed.as_client_server().unwrap();
        assert_eq!(message.transaction_id, [0xe8, 0x6f, 0x0c]);

        let query = message.lq_query().unwrap();
        assert_eq!(query.query_type, 1);
        assert_eq!(query.link_address, "fe80::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            query.options,
            vec![DhcpOption::OptionRequest(vec![
                crate::options::OPTION_LQ_RELAY_DATA
            ])]
        );
    }

    #[test]
    fn unknown_message_round_trips() {
        let wire = [0x63, 0xde, 0xad, 0xbe, 0xef];
        let message = round_trip(&wire);
        assert!(matches!(message, Message::Unknown(_)));
        assert_eq!(message.message_type(), MessageType::Unknown(0x63));
    }

    #[test]
    fn truncated_relay_header_fails() {
        let wire = [0x0c, 0x00, 0x20, 0x01];
        assert_eq!(Message::parse(&wire), Err(Error::LengthOverflow));
    }

    #[test]
    fn direction_flags() {
        assert!(MessageType::Solicit.from_client_to_server());
        assert!(!MessageType::Solicit.from_server_to_client());
        assert!(MessageType::Reply.from_server_to_client());
        assert!(!MessageType::Advertise.from_client_to_server());
        assert!(MessageType::Leasequery.from_client_to_server());
        assert!(MessageType::LeasequeryData.from_server_to_client());
        assert!(!MessageType::Unknown(200).from_client_to_server());
        assert!(!MessageType::Unknown(200).from_server_to_client());
    }

    #[test]
    fn deep_relay_chain_parses() {
        // Build a chain with hop-count 255 by nesting 4 relays (depth is what
        // matters for the parser; the hop count field itself is just data)
        let mut message = Message::ClientServer(ClientServerMessage::new(
            MessageType::Solicit,
            [1, 2, 3],
        ));

        for hop in 0..4u8 {
            let mut relay = RelayMessage {
                message_type: MessageType::RelayForward,
                hop_count: if hop == 3 { 255 } else { hop },
                link_address: Ipv6Addr::UNSPECIFIED,
                peer_address: Ipv6Addr::LOCALHOST,
                options: Vec::new(),
            };
            relay.set_relayed_message(message);
            message = Message::Relay(relay);
        }

        let wire = message.save().unwrap();
        let reparsed = Message::parse(&wire).unwrap();
        assert_eq!(reparsed, message);
        assert_eq!(reparsed.as_relay().unwrap().hop_count, 255);
    }
}
