//! The transaction bundle: everything about one in-flight request.
//!
//! A bundle is owned by a single worker for the lifetime of one request.
//! Construction splits the incoming relay chain into the innermost client
//! request and the list of relay-forward hops (closest to the client first);
//! the transport has already wrapped even directly-received messages in one
//! synthetic outer hop, so the chain is never empty for a recognised
//! request. The outgoing relay chain mirrors the incoming one and is
//! assembled into a nested reply message on demand, so a handler may replace
//! the response even after the chain was built.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;

use log::warn;

use sedge_proto::message::{ClientServerMessage, Message, MessageType, RelayMessage};
use sedge_proto::options::DhcpOption;

pub struct TransactionBundle {
    /// The raw incoming message, relay chain included.
    pub incoming_message: Message,
    pub received_over_multicast: bool,
    pub received_over_tcp: bool,

    /// The innermost client request, if recognised and client-to-server.
    /// `None` makes the bundle inert: no handler runs, no reply is sent.
    pub request: Option<ClientServerMessage>,

    /// The relay-forward hops, closest to the client first, each with its
    /// relay-message option removed.
    pub incoming_relay_messages: Vec<RelayMessage>,

    /// The response under construction.
    pub response: Option<ClientServerMessage>,

    /// Extra response messages for a bulk leasequery stream. When set, the
    /// transport sends these after the message in `response`.
    pub responses: Vec<ClientServerMessage>,

    /// The mirrored relay-reply hops, same order as the incoming ones.
    pub outgoing_relay_messages: Vec<RelayMessage>,

    /// Request-side options some handler has taken responsibility for.
    /// Append-only within a transaction.
    handled_options: Vec<DhcpOption>,

    /// Opaque labels attached by filters and handlers to scope processing.
    pub marks: HashSet<String>,

    handler_state: HashMap<TypeId, Box<dyn Any + Send>>,

    /// Set by a server-unicast handler to let unicast requests through.
    pub allow_unicast: bool,

    /// May be lowered by handlers, never raised back.
    pub allow_rapid_commit: bool,
}

impl TransactionBundle {
    pub fn new(
        incoming_message: Message,
        received_over_multicast: bool,
        received_over_tcp: bool,
    ) -> Self {
        let (request, incoming_relay_messages) = Self::split_relay_chain(&incoming_message);

        Self {
            incoming_message,
            received_over_multicast,
            received_over_tcp,
            request,
            incoming_relay_messages,
            response: None,
            responses: Vec::new(),
            outgoing_relay_messages: Vec::new(),
            handled_options: Vec::new(),
            marks: HashSet::new(),
            handler_state: HashMap::new(),
            allow_unicast: false,
            allow_rapid_commit: false,
        }
    }

    /// Separate the relay chain from the client request.
    ///
    /// Returns the hops closest-to-the-client first. An unrecognised or
    /// server-to-client innermost message yields `(None, [])`.
    fn split_relay_chain(message: &Message) -> (Option<ClientServerMessage>, Vec<RelayMessage>) {
        let mut relays: Vec<RelayMessage> = Vec::new();
        let mut current = message;

        while let Message::Relay(relay) = current {
            if relay.message_type != MessageType::RelayForward {
                warn!(
                    "A server should not receive {} from a client",
                    current.class_name()
                );
                return (None, Vec::new());
            }

            let mut stripped = relay.clone();
            stripped
                .options
                .retain(|option| !matches!(option, DhcpOption::RelayMessage(_)));
            relays.insert(0, stripped);

            match relay.relayed_message() {
                Some(inner) => current = inner,
                None => {
                    warn!("Relay-forward message without a relay-message option");
                    return (None, Vec::new());
                }
            }
        }

        match current {
            Message::ClientServer(inner) if inner.message_type.from_client_to_server() => {
                (Some(inner.clone()), relays)
            }
            Message::Unknown(inner) => {
                warn!("Received an unrecognised message of type {}", inner.message_type);
                (None, Vec::new())
            }
            other => {
                warn!(
                    "A server should not receive {} from a client",
                    other.class_name()
                );
                (None, Vec::new())
            }
        }
    }

    /// The link the client request came in on: the first relay link-address
    /// that is not unspecified, loopback or link-local, or `::` when no hop
    /// carries a usable one (LDRA relays, directly received requests).
    pub fn link_address(&self) -> Ipv6Addr {
        for relay in &self.incoming_relay_messages {
            let address = relay.link_address;
            if !address.is_unspecified() && !address.is_loopback() && !is_link_local(&address) {
                return address;
            }
        }

        Ipv6Addr::UNSPECIFIED
    }

    /// The peer addresses of the relay chain, closest to the client first.
    pub fn relays(&self) -> Vec<Ipv6Addr> {
        self.incoming_relay_messages
            .iter()
            .map(|relay| relay.peer_address)
            .collect()
    }

    /// The relay the client talked to, which carries the interface-id,
    /// remote-id and similar identification options.
    pub fn relay_closest_to_client(&self) -> Option<&RelayMessage> {
        self.incoming_relay_messages.first()
    }

    /// Build the plain relay-reply chain mirroring the incoming hops.
    pub fn create_outgoing_relay_messages(&mut self) {
        self.outgoing_relay_messages = self
            .incoming_relay_messages
            .iter()
            .map(|relay| RelayMessage {
                message_type: MessageType::RelayReply,
                hop_count: relay.hop_count,
                link_address: relay.link_address,
                peer_address: relay.peer_address,
                options: Vec::new(),
            })
            .collect();
    }

    /// The complete outgoing message: the current response wrapped in the
    /// relay-reply chain, assembled innermost-first so the chain always
    /// carries whatever `response` holds right now.
    pub fn outgoing_message(&mut self) -> Option<Message> {
        let response = self.response.clone()?;

        if !response.message_type.from_server_to_client() {
            log::error!(
                "A server should not send {} to a client",
                response.message_type.class_name()
            );
            return None;
        }

        if !self.incoming_relay_messages.is_empty() && self.outgoing_relay_messages.is_empty() {
            self.create_outgoing_relay_messages();
        }

        let mut outgoing = Message::ClientServer(response);
        for relay in &self.outgoing_relay_messages {
            let mut hop = relay.clone();
            hop.set_relayed_message(outgoing);
            outgoing = Message::Relay(hop);
        }

        Some(outgoing)
    }

    /// Mark a request-side option as handled. Marking twice is a no-op.
    pub fn mark_handled(&mut self, option: &DhcpOption) {
        if !self.handled_options.contains(option) {
            self.handled_options.push(option.clone());
        }
    }

    pub fn handled_options(&self) -> &[DhcpOption] {
        &self.handled_options
    }

    /// Request-side options matching `filter` that no handler has claimed.
    pub fn unhandled_options(&self, filter: impl Fn(&DhcpOption) -> bool) -> Vec<DhcpOption> {
        let Some(request) = &self.request else {
            return Vec::new();
        };

        request
            .options
            .iter()
            .filter(|option| filter(option) && !self.handled_options.contains(option))
            .cloned()
            .collect()
    }

    pub fn add_mark(&mut self, mark: &str) {
        self.marks.insert(mark.trim().to_string());
    }

    /// A typed scratch slot for one handler, keyed by a marker type the
    /// handler owns. Used to carry values between its phases.
    pub fn set_handler_state<T: Any + Send>(&mut self, value: T) {
        self.handler_state.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn handler_state<T: Any + Send>(&self) -> Option<&T> {
        self.handler_state
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn take_handler_state<T: Any + Send>(&mut self) -> Option<T> {
        self.handler_state
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok())
            .map(|value| *value)
    }

    /// Short description for log lines: message type, client DUID, relay path
    /// and marks.
    pub fn describe(&self) -> String {
        let Some(request) = &self.request else {
            return "unrecognised message".to_string();
        };

        let duid = request
            .client_id()
            .map(|duid| duid.hex())
            .unwrap_or_else(|| "unknown".to_string());
        let mut output = format!("{} from {}", request.message_type.class_name(), duid);

        let interesting: Vec<&RelayMessage> = self
            .incoming_relay_messages
            .iter()
            .filter(|relay| !relay.link_address.is_unspecified())
            .collect();
        if let Some(first) = interesting.first() {
            output.push_str(&format!(" at {} via {}", first.peer_address, first.link_address));
            for relay in &interesting[1..] {
                output.push_str(&format!(" -> {}", relay.link_address));
            }
        }

        if !self.marks.is_empty() {
            let mut marks: Vec<&str> = self.marks.iter().map(String::as_str).collect();
            marks.sort_unstable();
            output.push_str(&format!(" with marks '{}'", marks.join("', '")));
        }

        output
    }
}

pub fn is_link_local(address: &Ipv6Addr) -> bool {
    (address.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::duid::Duid;
    use sedge_proto::options::{IaNaOption, OPTION_IA_NA};

    fn client_duid() -> Duid {
        Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1],
        }
    }

    fn solicit() -> ClientServerMessage {
        let mut message = ClientServerMessage::new(MessageType::Solicit, [0xf3, 0x50, 0xd6]);
        message.options.push(DhcpOption::ClientId(client_duid()));
        message
    }

    fn wrap(message: Message, hop: u8, link: &str, peer: &str) -> Message {
        let mut relay = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: hop,
            link_address: link.parse().unwrap(),
            peer_address: peer.parse().unwrap(),
            options: Vec::new(),
        };
        relay.set_relayed_message(message);
        Message::Relay(relay)
    }

    fn relayed_solicit() -> Message {
        let inner = wrap(
            Message::ClientServer(solicit()),
            0,
            "2001:db8:ffff:1::1",
            "fe80::1",
        );
        // the synthetic hop added by the transport
        wrap(inner, 1, "::", "fe80::2")
    }

    #[test]
    fn split_chain_orders_hops_client_first() {
        let bundle = TransactionBundle::new(relayed_solicit(), true, false);

        assert!(bundle.request.is_some());
        assert_eq!(bundle.incoming_relay_messages.len(), 2);
        assert_eq!(
            bundle.incoming_relay_messages[0].link_address,
            "2001:db8:ffff:1::1".parse::<Ipv6Addr>().unwrap()
        );
        assert!(bundle.incoming_relay_messages[1].link_address.is_unspecified());
        // the relay-message options were stripped from the stored hops
        assert!(bundle.incoming_relay_messages[0].relayed_message().is_none());
    }

    #[test]
    fn link_address_skips_useless_hops() {
        let bundle = TransactionBundle::new(relayed_solicit(), true, false);
        assert_eq!(
            bundle.link_address(),
            "2001:db8:ffff:1::1".parse::<Ipv6Addr>().unwrap()
        );

        // an LDRA-style chain with only link-local/unspecified link addresses
        let inner = wrap(Message::ClientServer(solicit()), 0, "fe80::99", "fe80::1");
        let message = wrap(inner, 1, "::", "fe80::2");
        let bundle = TransactionBundle::new(message, true, false);
        assert!(bundle.link_address().is_unspecified());
    }

    #[test]
    fn server_to_client_message_is_inert() {
        let reply = ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]);
        let bundle = TransactionBundle::new(Message::ClientServer(reply), false, false);
        assert!(bundle.request.is_none());
        assert!(bundle.incoming_relay_messages.is_empty());
    }

    #[test]
    fn outgoing_chain_mirrors_incoming() {
        let mut bundle = TransactionBundle::new(relayed_solicit(), true, false);
        bundle.response = Some(ClientServerMessage::new(
            MessageType::Advertise,
            [0xf3, 0x50, 0xd6],
        ));

        let outgoing = bundle.outgoing_message().unwrap();
        assert_eq!(
            bundle.outgoing_relay_messages.len(),
            bundle.incoming_relay_messages.len()
        );

        // outermost hop first on the wire, carrying the next hop inside
        let outer = outgoing.as_relay().unwrap();
        assert_eq!(outer.message_type, MessageType::RelayReply);
        assert_eq!(outer.hop_count, 1);
        let inner = outer.relayed_message().unwrap().as_relay().unwrap();
        assert_eq!(inner.hop_count, 0);
        assert_eq!(
            inner.link_address,
            "2001:db8:ffff:1::1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            inner.relayed_message().unwrap().message_type(),
            MessageType::Advertise
        );
    }

    #[test]
    fn response_replacement_after_chain_creation_wins() {
        let mut bundle = TransactionBundle::new(relayed_solicit(), true, false);
        bundle.response = Some(ClientServerMessage::new(
            MessageType::Advertise,
            [0xf3, 0x50, 0xd6],
        ));
        let _ = bundle.outgoing_message();

        // a rapid-commit style replacement after the chain exists
        bundle.response = Some(ClientServerMessage::new(
            MessageType::Reply,
            [0xf3, 0x50, 0xd6],
        ));
        let outgoing = bundle.outgoing_message().unwrap();
        let outer = outgoing.as_relay().unwrap();
        let inner = outer.relayed_message().unwrap().as_relay().unwrap();
        assert_eq!(
            inner.relayed_message().unwrap().message_type(),
            MessageType::Reply
        );
    }

    #[test]
    fn mark_handled_is_idempotent() {
        let mut message = solicit();
        message.options.push(DhcpOption::IaNa(IaNaOption::new(1)));
        let mut bundle =
            TransactionBundle::new(Message::ClientServer(message), true, false);

        let ia = bundle.request.as_ref().unwrap().options[1].clone();
        bundle.mark_handled(&ia);
        bundle.mark_handled(&ia);
        assert_eq!(bundle.handled_options().len(), 1);
        assert!(bundle
            .unhandled_options(|option| option.code() == OPTION_IA_NA)
            .is_empty());
    }

    #[test]
    fn handler_state_round_trips() {
        struct Scratch(u32);

        let mut bundle =
            TransactionBundle::new(Message::ClientServer(solicit()), true, false);
        bundle.set_handler_state(Scratch(42));
        assert_eq!(bundle.handler_state::<Scratch>().unwrap().0, 42);
        assert_eq!(bundle.take_handler_state::<Scratch>().unwrap().0, 42);
        assert!(bundle.handler_state::<Scratch>().is_none());
    }

    #[test]
    fn marks_are_trimmed_and_deduplicated() {
        let mut bundle =
            TransactionBundle::new(Message::ClientServer(solicit()), true, false);
        bundle.add_mark(" gold ");
        bundle.add_mark("gold");
        assert_eq!(bundle.marks.len(), 1);
        assert!(bundle.marks.contains("gold"));
    }
}
