//! Leasequery (RFC 5007) and bulk leasequery (RFC 5460) support.
//!
//! The store records the leases visible in outgoing replies and answers the
//! five query modes. The handler glues it into the pipeline: access control
//! in `pre`, query execution in `handle`, lease observation in
//! `analyse_post`. Two guard handlers keep the transports honest: a bulk
//! connection only accepts leasequery, and the bulk-only query types are
//! refused over UDP.

pub mod sqlite;

use std::net::Ipv6Addr;

use log::{error, warn};

use ipnet::Ipv6Net;
use thiserror::Error;

use sedge_proto::message::{ClientServerMessage, Message, MessageType, RelayMessage};
use sedge_proto::options::leasequery::{
    QUERY_BY_LINK_ADDRESS, QUERY_BY_RELAY_ID, QUERY_BY_REMOTE_ID,
};
use sedge_proto::options::{
    ClientDataOption, DhcpOption, LqQueryOption, LqRelayDataOption, StatusCodeOption,
    OPTION_CLIENTID, OPTION_IAADDR, OPTION_IAPREFIX, OPTION_IA_NA, OPTION_IA_PD, OPTION_IA_TA,
    OPTION_ORO, OPTION_RELAY_MSG, OPTION_SERVERID, OPTION_STATUS_CODE, STATUS_NOT_ALLOWED,
    STATUS_QUERY_TERMINATED, STATUS_SUCCESS, STATUS_UNKNOWN_QUERY_TYPE, STATUS_UNSPEC_FAIL,
};

use crate::bundle::TransactionBundle;
use crate::handlers::{Handler, HandlerError, HandlerResult};
use crate::ServerError;

/// Control options are modelled explicitly by the store schema and never
/// kept inside opaque option blobs.
pub const NEVER_STORED_OPTIONS: [u16; 10] = [
    OPTION_CLIENTID,
    OPTION_SERVERID,
    OPTION_RELAY_MSG,
    OPTION_ORO,
    OPTION_IA_NA,
    OPTION_IA_TA,
    OPTION_IA_PD,
    OPTION_IAADDR,
    OPTION_IAPREFIX,
    OPTION_STATUS_CODE,
];

/// The outcome of a query: how many bindings matched and their client data.
///
/// A negative count means the store does not support the query type at all.
pub struct LeaseResult {
    pub count: i64,
    pub leases: Vec<(Ipv6Addr, ClientDataOption)>,
}

#[derive(Debug, Error)]
pub enum FindError {
    /// The query is missing a required option.
    #[error("malformed query: {0}")]
    Malformed(String),

    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store used before worker initialisation")]
    NotReady,
}

pub trait LeasequeryStore: Send {
    /// Open per-worker resources (the database connection) and remember
    /// which options are too sensitive to store or return.
    fn worker_init(&mut self, sensitive_options: &[u16]) -> Result<(), ServerError>;

    /// Observe a completed transaction and remember its leases.
    fn remember_lease(&mut self, bundle: &TransactionBundle) -> Result<(), ServerError>;

    /// Execute one query.
    fn find_leases(&mut self, query: &LqQueryOption) -> Result<LeaseResult, FindError>;
}

/// Remove the given option codes from a list of options.
pub fn filter_options(options: &[DhcpOption], unwanted: &[u16]) -> Vec<DhcpOption> {
    options
        .iter()
        .filter(|option| !unwanted.contains(&option.code()))
        .cloned()
        .collect()
}

/// Serialise the storable subset of `options` as concatenated wire bytes.
pub fn encode_options(options: &[DhcpOption], sensitive: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    for option in options {
        let code = option.code();
        if sensitive.contains(&code) || NEVER_STORED_OPTIONS.contains(&code) {
            continue;
        }
        // the options were parsed from the wire, re-encoding cannot fail
        if option.write(&mut out).is_err() {
            warn!("Could not encode option {} for storage", code);
        }
    }

    out
}

pub fn decode_options(data: &[u8]) -> Result<Vec<DhcpOption>, sedge_proto::Error> {
    let mut bytes = sedge_proto::bytes::BytesIn::new(data);
    sedge_proto::options::parse_options(&mut bytes)
}

/// Serialise the incoming relay chain for storage. The hops already lack
/// their relay-message options; they are re-nested so that the outermost hop
/// (the synthetic one added by the transport, whose peer-address is the
/// packet source) ends up outermost again.
pub fn encode_relay_messages(hops: &[RelayMessage], sensitive: &[u16]) -> Vec<u8> {
    let mut chain: Option<Message> = None;

    for hop in hops {
        let mut stored = hop.clone();
        stored.options = filter_options(&stored.options, sensitive)
            .into_iter()
            .filter(|option| !NEVER_STORED_OPTIONS.contains(&option.code()))
            .collect();

        if let Some(inner) = chain.take() {
            stored.set_relayed_message(inner);
        }
        chain = Some(Message::Relay(stored));
    }

    match chain {
        Some(message) => message.save().unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Rebuild an `LQRelayDataOption` from stored relay data. The outermost
/// (synthetic) hop only contributes the peer address; when nothing but the
/// synthetic hop was stored the client talked to us directly and no relay
/// data is returned.
pub fn relay_data_option(relay_data: &[u8]) -> Option<LqRelayDataOption> {
    if relay_data.is_empty() {
        return None;
    }

    let message = match Message::parse(relay_data) {
        Ok(message) => message,
        Err(e) => {
            error!("Ignoring unparsable relay data in lease database: {}", e);
            return None;
        }
    };

    let outer = message.as_relay()?;
    let peer_address = outer.peer_address;

    let inner = outer.relayed_message()?;
    if !matches!(inner, Message::Relay(_)) {
        return None;
    }

    Some(LqRelayDataOption {
        peer_address,
        relay_message: Box::new(inner.clone()),
    })
}

/// All remote-ids in the relay chain, as their storage identity strings.
pub fn remote_ids(bundle: &TransactionBundle) -> Vec<String> {
    let mut ids = Vec::new();
    for relay in &bundle.incoming_relay_messages {
        for option in &relay.options {
            if let DhcpOption::RemoteId(remote) = option {
                ids.push(remote.identity());
            }
        }
    }

    ids
}

/// All relay DUIDs in the relay chain, as lower-case hex.
pub fn relay_ids(bundle: &TransactionBundle) -> Vec<String> {
    let mut ids = Vec::new();
    for relay in &bundle.incoming_relay_messages {
        for option in &relay.options {
            if let DhcpOption::RelayId(duid) = option {
                ids.push(duid.hex());
            }
        }
    }

    ids
}

/// The handler wiring the store into the pipeline.
pub struct LeasequeryHandler {
    store: Box<dyn LeasequeryStore>,
    allow_from: Vec<Ipv6Net>,
    sensitive_options: Vec<u16>,
}

impl LeasequeryHandler {
    pub fn new(
        store: Box<dyn LeasequeryStore>,
        allow_from: Vec<Ipv6Net>,
        sensitive_options: Vec<u16>,
    ) -> Self {
        Self {
            store,
            allow_from,
            sensitive_options,
        }
    }

    fn build_bulk_responses(
        &self,
        bundle: &mut TransactionBundle,
        leases: Vec<(Ipv6Addr, ClientDataOption)>,
    ) {
        let mut leases = leases.into_iter();

        let transaction_id = match &bundle.response {
            Some(response) => response.transaction_id,
            None => return,
        };

        if let Some((_, first)) = leases.next() {
            if let Some(response) = bundle.response.as_mut() {
                response.options.push(DhcpOption::ClientData(first));
            }

            for (_, data) in leases {
                let mut message =
                    ClientServerMessage::new(MessageType::LeasequeryData, transaction_id);
                message.options.push(DhcpOption::ClientData(data));
                bundle.responses.push(message);
            }

            let mut done = ClientServerMessage::new(MessageType::LeasequeryDone, transaction_id);
            done.options.push(DhcpOption::StatusCode(StatusCodeOption::new(
                STATUS_SUCCESS,
                "All bindings sent",
            )));
            bundle.responses.push(done);
        }
        // No bindings: the leasequery-reply goes out with neither status
        // nor client data.
    }

    fn build_udp_response(
        &self,
        bundle: &mut TransactionBundle,
        leases: Vec<(Ipv6Addr, ClientDataOption)>,
    ) {
        if leases.len() == 1 {
            let (_, data) = leases.into_iter().next().expect("length checked");
            if let Some(response) = bundle.response.as_mut() {
                response.options.push(DhcpOption::ClientData(data));
            }
        } else if leases.len() > 1 {
            // Client on multiple links: answer with the links and let the
            // requestor re-query per link
            let mut links: Vec<Ipv6Addr> =
                leases.into_iter().map(|(link, _)| link).collect();
            links.sort_unstable();
            links.dedup();

            if let Some(response) = bundle.response.as_mut() {
                response.options.push(DhcpOption::LqClientLink(links));
            }
        }
    }
}

impl Handler for LeasequeryHandler {
    fn name(&self) -> &'static str {
        "leasequery"
    }

    fn worker_init(&mut self) -> Result<(), ServerError> {
        self.store.worker_init(&self.sensitive_options)
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        if request.message_type != MessageType::Leasequery {
            return Ok(());
        }

        // Access is checked against the relay closest to the client; for a
        // directly-connected requestor that is the synthetic hop holding the
        // packet's source address.
        let requestor = bundle
            .relay_closest_to_client()
            .map(|relay| relay.peer_address)
            .unwrap_or(Ipv6Addr::UNSPECIFIED);

        if !self.allow_from.iter().any(|net| net.contains(&requestor)) {
            return Err(HandlerError::reply_with_leasequery(
                STATUS_NOT_ALLOWED,
                "Leasequery not allowed from your address",
            ));
        }

        Ok(())
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        if request.message_type != MessageType::Leasequery {
            return Ok(());
        }

        let queries =
            bundle.unhandled_options(|option| matches!(option, DhcpOption::LqQuery(_)));
        let Some(query_option) = queries.first() else {
            return Ok(());
        };
        let DhcpOption::LqQuery(query) = query_option else {
            unreachable!()
        };

        let result = match self.store.find_leases(query) {
            Ok(result) => result,
            Err(FindError::Malformed(message)) => {
                return Err(HandlerError::reply_with_leasequery(
                    sedge_proto::options::STATUS_MALFORMED_QUERY,
                    message,
                ))
            }
            Err(e @ (FindError::Store(_) | FindError::NotReady)) => {
                error!("Error while executing leasequery: {}", e);
                let (code, text) = if bundle.received_over_tcp {
                    (STATUS_QUERY_TERMINATED, "Error constructing your reply, please try again")
                } else {
                    (STATUS_UNSPEC_FAIL, "Error constructing your reply, please try again")
                };
                return Err(HandlerError::reply_with_leasequery(code, text));
            }
        };

        // A negative count means this query type is not supported here;
        // leave the query unhandled for the unanswered-query handler.
        if result.count < 0 {
            return Ok(());
        }

        let handled = query_option.clone();
        bundle.mark_handled(&handled);

        if bundle.received_over_tcp {
            self.build_bulk_responses(bundle, result.leases);
        } else {
            self.build_udp_response(bundle, result.leases);
        }

        Ok(())
    }

    fn analyse_post(&mut self, bundle: &mut TransactionBundle) -> Result<(), ServerError> {
        // Advertise messages promise nothing; replies commit leases. Rapid
        // commit has already turned its advertise into a reply by now.
        let is_reply = bundle
            .response
            .as_ref()
            .map(|response| response.message_type == MessageType::Reply)
            .unwrap_or(false);

        if is_reply {
            self.store.remember_lease(bundle)?;
        }

        Ok(())
    }
}

/// Over a bulk leasequery connection only leasequery messages are valid.
pub struct RequireLeasequeryOverTcpHandler;

impl Handler for RequireLeasequeryOverTcpHandler {
    fn name(&self) -> &'static str {
        "require-leasequery-over-tcp"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if !bundle.received_over_tcp {
            return Ok(());
        }

        let is_leasequery = bundle
            .request
            .as_ref()
            .map(|request| request.message_type == MessageType::Leasequery)
            .unwrap_or(false);
        if !is_leasequery {
            warn!("Client sent non-leasequery message over a bulk leasequery connection");
            return Err(HandlerError::cannot_respond(
                "only leasequery is accepted over TCP",
            ));
        }

        Ok(())
    }
}

/// The query types introduced by bulk leasequery are refused over UDP with a
/// not-allowed status.
pub struct RefuseBulkQueryTypesOverUdpHandler;

impl Handler for RefuseBulkQueryTypesOverUdpHandler {
    fn name(&self) -> &'static str {
        "refuse-bulk-query-types-over-udp"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if bundle.received_over_tcp {
            return Ok(());
        }

        let Some(request) = &bundle.request else {
            return Ok(());
        };
        if request.message_type != MessageType::Leasequery {
            return Ok(());
        }

        if let Some(query) = request.lq_query() {
            if matches!(
                query.query_type,
                QUERY_BY_RELAY_ID | QUERY_BY_LINK_ADDRESS | QUERY_BY_REMOTE_ID
            ) {
                return Err(HandlerError::reply_with_leasequery(
                    STATUS_NOT_ALLOWED,
                    format!(
                        "Query type {} is only allowed over bulk leasequery",
                        query.query_type
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// A leasequery nobody answered means nobody understood the query type.
pub struct UnansweredLeasequeryHandler;

impl Handler for UnansweredLeasequeryHandler {
    fn name(&self) -> &'static str {
        "unanswered-leasequery"
    }

    fn post(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        if request.message_type != MessageType::Leasequery {
            return Ok(());
        }

        let unhandled =
            bundle.unhandled_options(|option| matches!(option, DhcpOption::LqQuery(_)));
        if let Some(DhcpOption::LqQuery(query)) = unhandled.first() {
            return Err(HandlerError::reply_with_leasequery(
                STATUS_UNKNOWN_QUERY_TYPE,
                format!("This server can't handle query type {}", query.query_type),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::options::RemoteIdOption;
    use sedge_proto::Duid;

    #[test]
    fn storable_encoding_skips_control_options() {
        let options = vec![
            DhcpOption::ClientId(Duid::LinkLayer {
                hardware_type: 1,
                link_layer_address: vec![1, 2, 3, 4, 5, 6],
            }),
            DhcpOption::Preference(10),
            DhcpOption::RemoteId(RemoteIdOption {
                enterprise_number: 9,
                remote_id: vec![1, 2],
            }),
        ];

        let encoded = encode_options(&options, &[]);
        let decoded = decode_options(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[0], DhcpOption::Preference(10)));

        // sensitive options are dropped too
        let encoded = encode_options(&options, &[sedge_proto::options::OPTION_REMOTE_ID]);
        let decoded = decode_options(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn relay_data_round_trip() {
        use sedge_proto::message::MessageType;

        // a real relay hop and the synthetic outer hop
        let real = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 0,
            link_address: "2001:db8:ffff:1::1".parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: vec![DhcpOption::InterfaceId(b"eth7".to_vec())],
        };
        let synthetic = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 1,
            link_address: "2001:db8::1".parse().unwrap(),
            peer_address: "2001:db8:beef::5".parse().unwrap(),
            options: Vec::new(),
        };

        let encoded = encode_relay_messages(&[real, synthetic], &[]);
        let option = relay_data_option(&encoded).unwrap();

        // the synthetic hop provides the peer address...
        assert_eq!(
            option.peer_address,
            "2001:db8:beef::5".parse::<Ipv6Addr>().unwrap()
        );
        // ...and the stored message starts at the real relay
        let relay = option.relay_message.as_relay().unwrap();
        assert_eq!(relay.interface_id(), Some(&b"eth7"[..]));
    }

    #[test]
    fn direct_client_has_no_relay_data() {
        use sedge_proto::message::MessageType;

        let synthetic = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 0,
            link_address: "2001:db8::1".parse().unwrap(),
            peer_address: "2001:db8::99".parse().unwrap(),
            options: Vec::new(),
        };

        let encoded = encode_relay_messages(&[synthetic], &[]);
        assert!(relay_data_option(&encoded).is_none());
        assert!(relay_data_option(&[]).is_none());
    }
}
