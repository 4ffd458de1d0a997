//! The mandatory handlers: server-id check and install, client-id copy,
//! rapid commit, unicast policy, the unanswered-IA filler and the missing
//! status-code filler.

use log::{debug, info};

use sedge_proto::message::{ClientServerMessage, MessageType};
use sedge_proto::options::ia::is_accepted;
use sedge_proto::options::{
    DhcpOption, IaNaOption, IaPdOption, IaPrefixOption, IaTaOption, StatusCodeOption,
    STATUS_NO_ADDRS_AVAIL, STATUS_NO_PREFIX_AVAIL, STATUS_SUCCESS,
};
use sedge_proto::Duid;

use crate::bundle::TransactionBundle;
use crate::handlers::basic::{CopyOptionHandler, SimpleOptionHandler};
use crate::handlers::{Handler, HandlerError, HandlerResult};

/// Checks that a request carrying a server-id is really for us, and installs
/// our server-id in every response.
pub struct ServerIdHandler {
    duid: Duid,
    install: SimpleOptionHandler,
}

impl ServerIdHandler {
    pub fn new(duid: Duid) -> Self {
        let install =
            SimpleOptionHandler::new("server-id", DhcpOption::ServerId(duid.clone()), true);
        Self { duid, install }
    }
}

impl Handler for ServerIdHandler {
    fn name(&self) -> &'static str {
        "server-id"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if let Some(request) = &bundle.request {
            if let Some(server_id) = request.server_id() {
                if *server_id != self.duid {
                    return Err(HandlerError::ForOtherServer(format!(
                        "their {} is not our {}",
                        server_id.hex(),
                        self.duid.hex()
                    )));
                }
            }
        }

        Ok(())
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        self.install.handle(bundle)
    }
}

/// Copies the client-id from the request into the response.
pub struct ClientIdHandler {
    copy: CopyOptionHandler,
}

impl ClientIdHandler {
    pub fn new() -> Self {
        Self {
            copy: CopyOptionHandler::new(
                "client-id",
                sedge_proto::options::OPTION_CLIENTID,
                true,
            ),
        }
    }
}

impl Default for ClientIdHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for ClientIdHandler {
    fn name(&self) -> &'static str {
        "client-id"
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        self.copy.handle(bundle)
    }
}

/// Turns an Advertise into a Reply when the client asked for rapid commit
/// and the configuration allows it. Runs first in the `post` phase so every
/// other handler has already shaped the answer.
pub struct RapidCommitHandler {
    /// Also commit when the answer assigns nothing (rejections).
    pub rapid_commit_rejections: bool,
}

impl Handler for RapidCommitHandler {
    fn name(&self) -> &'static str {
        "rapid-commit"
    }

    fn post(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if !bundle.allow_rapid_commit {
            return Ok(());
        }

        let Some(request) = &bundle.request else {
            return Ok(());
        };
        if request.message_type != MessageType::Solicit || !request.has_rapid_commit() {
            return Ok(());
        }

        let Some(response) = &bundle.response else {
            return Ok(());
        };
        if response.message_type != MessageType::Advertise {
            return Ok(());
        }

        if !self.rapid_commit_rejections && !assigns_anything(response) {
            debug!("Not rapid-committing a response that assigns nothing");
            return Ok(());
        }

        let mut reply = response.clone();
        reply.message_type = MessageType::Reply;
        reply.options.push(DhcpOption::RapidCommit);
        bundle.response = Some(reply);

        Ok(())
    }
}

/// Whether any IA in the response actually carries an accepted address or
/// prefix.
fn assigns_anything(response: &ClientServerMessage) -> bool {
    response.options.iter().any(|option| match option {
        DhcpOption::IaNa(ia) => is_accepted(ia.status_code()) && ia.addresses().next().is_some(),
        DhcpOption::IaTa(ia) => is_accepted(ia.status_code()) && ia.addresses().next().is_some(),
        DhcpOption::IaPd(ia) => is_accepted(ia.status_code()) && ia.prefixes().next().is_some(),
        _ => false,
    })
}

/// Tells every matching client to use multicast, whatever the transport.
pub struct RequireMulticastHandler;

impl Handler for RequireMulticastHandler {
    fn name(&self) -> &'static str {
        "require-multicast"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if !bundle.received_over_multicast {
            info!("Rejecting unicast {}", bundle.describe());
            return Err(HandlerError::UseMulticast(
                "this server does not accept unicast requests".into(),
            ));
        }

        Ok(())
    }
}

/// Allows unicast for matching clients and advertises the address they may
/// use.
pub struct ServerUnicastOptionHandler {
    install: SimpleOptionHandler,
}

impl ServerUnicastOptionHandler {
    pub fn new(address: std::net::Ipv6Addr) -> Self {
        Self {
            install: SimpleOptionHandler::new(
                "server-unicast",
                DhcpOption::ServerUnicast(address),
                true,
            ),
        }
    }
}

impl Handler for ServerUnicastOptionHandler {
    fn name(&self) -> &'static str {
        "server-unicast"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        bundle.allow_unicast = true;
        Ok(())
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        self.install.handle(bundle)
    }
}

/// The default unicast policy: unless some handler allowed unicast, a
/// request that arrived neither over multicast nor through a real relay is
/// answered with a use-multicast status.
///
/// The relay count includes the synthetic hop the transport adds, so "went
/// through a relay" means at least two hops. Leasequery requestors always
/// unicast and bulk connections are TCP, so both are exempt.
pub struct RejectUnwantedUnicastHandler;

impl Handler for RejectUnwantedUnicastHandler {
    fn name(&self) -> &'static str {
        "reject-unwanted-unicast"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if bundle.received_over_tcp {
            return Ok(());
        }
        if let Some(request) = &bundle.request {
            if request.message_type == MessageType::Leasequery {
                return Ok(());
            }
        }

        if !bundle.allow_unicast
            && !bundle.received_over_multicast
            && bundle.incoming_relay_messages.len() < 2
        {
            info!("Rejecting unicast {}", bundle.describe());
            return Err(HandlerError::UseMulticast(
                "this server does not support unicast requests".into(),
            ));
        }

        Ok(())
    }
}

/// Answers the IA options nothing else answered.
///
/// For Renew and Rebind the requested addresses and prefixes are echoed with
/// zero lifetimes so the client stops using them; everywhere else the IA
/// comes back with a no-addresses (or no-prefixes) status.
pub struct UnansweredIaHandler;

impl Handler for UnansweredIaHandler {
    fn name(&self) -> &'static str {
        "unanswered-ia"
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        let request_type = request.message_type;

        if bundle.response.is_none() || request_type == MessageType::Confirm {
            return Ok(());
        }

        let zero_lifetimes =
            request_type == MessageType::Renew || request_type == MessageType::Rebind;

        let unanswered = bundle.unhandled_options(|option| {
            matches!(
                option,
                DhcpOption::IaNa(_) | DhcpOption::IaTa(_) | DhcpOption::IaPd(_)
            )
        });

        for option in unanswered {
            let answer = match &option {
                DhcpOption::IaNa(ia) => {
                    let mut answer = IaNaOption::new(ia.iaid);
                    if zero_lifetimes {
                        answer.options.extend(ia.addresses().map(|addr| {
                            DhcpOption::IaAddress(
                                sedge_proto::options::IaAddressOption::new(addr.address, 0, 0),
                            )
                        }));
                    } else {
                        answer.options.push(no_addrs_avail());
                    }
                    DhcpOption::IaNa(answer)
                }
                DhcpOption::IaTa(ia) => {
                    let mut answer = IaTaOption::new(ia.iaid);
                    if zero_lifetimes {
                        answer.options.extend(ia.addresses().map(|addr| {
                            DhcpOption::IaAddress(
                                sedge_proto::options::IaAddressOption::new(addr.address, 0, 0),
                            )
                        }));
                    } else {
                        answer.options.push(no_addrs_avail());
                    }
                    DhcpOption::IaTa(answer)
                }
                DhcpOption::IaPd(ia) => {
                    let mut answer = IaPdOption::new(ia.iaid);
                    if zero_lifetimes {
                        answer.options.extend(ia.prefixes().map(|prefix| {
                            DhcpOption::IaPrefix(IaPrefixOption::new(
                                prefix.prefix,
                                prefix.prefix_length,
                                0,
                                0,
                            ))
                        }));
                    } else {
                        answer.options.push(DhcpOption::StatusCode(StatusCodeOption::new(
                            STATUS_NO_PREFIX_AVAIL,
                            "No prefixes available",
                        )));
                    }
                    DhcpOption::IaPd(answer)
                }
                _ => continue,
            };

            if let Some(response) = bundle.response.as_mut() {
                response.options.push(answer);
            }
            bundle.mark_handled(&option);
        }

        Ok(())
    }
}

fn no_addrs_avail() -> DhcpOption {
    DhcpOption::StatusCode(StatusCodeOption::new(
        STATUS_NO_ADDRS_AVAIL,
        "No addresses available",
    ))
}

/// Confirm, Release and Decline replies must carry a status code; add a
/// success if nothing else did.
pub struct AddMissingStatusHandler;

impl Handler for AddMissingStatusHandler {
    fn name(&self) -> &'static str {
        "add-missing-status"
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        if !matches!(
            request.message_type,
            MessageType::Confirm | MessageType::Release | MessageType::Decline
        ) {
            return Ok(());
        }

        if let Some(response) = bundle.response.as_mut() {
            if response.status_code().is_none() {
                response.options.push(DhcpOption::StatusCode(StatusCodeOption::new(
                    STATUS_SUCCESS,
                    "Your message has been dealt with",
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::message::Message;
    use sedge_proto::options::IaAddressOption;

    fn duid(last: u8) -> Duid {
        Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![0, 0, 0, 0, 0, last],
        }
    }

    fn request_bundle(message_type: MessageType, options: Vec<DhcpOption>) -> TransactionBundle {
        let mut request = ClientServerMessage::new(message_type, [1, 2, 3]);
        request.options = options;
        TransactionBundle::new(Message::ClientServer(request), true, false)
    }

    #[test]
    fn server_id_mismatch_short_circuits() {
        let mut handler = ServerIdHandler::new(duid(1));

        let mut bundle = request_bundle(
            MessageType::Request,
            vec![DhcpOption::ServerId(duid(2))],
        );
        assert!(matches!(
            handler.pre(&mut bundle),
            Err(HandlerError::ForOtherServer(_))
        ));

        let mut bundle = request_bundle(
            MessageType::Request,
            vec![DhcpOption::ServerId(duid(1))],
        );
        assert!(handler.pre(&mut bundle).is_ok());
    }

    #[test]
    fn rapid_commit_rewrites_accepting_advertise() {
        let mut handler = RapidCommitHandler {
            rapid_commit_rejections: false,
        };

        let mut ia = IaNaOption::new(7);
        ia.options.push(DhcpOption::IaAddress(IaAddressOption::new(
            "2001:db8::100".parse().unwrap(),
            375,
            600,
        )));

        let mut bundle = request_bundle(MessageType::Solicit, vec![DhcpOption::RapidCommit]);
        bundle.allow_rapid_commit = true;
        let mut response = ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]);
        response.options.push(DhcpOption::IaNa(ia));
        bundle.response = Some(response);

        handler.post(&mut bundle).unwrap();

        let response = bundle.response.as_ref().unwrap();
        assert_eq!(response.message_type, MessageType::Reply);
        assert!(response.has_rapid_commit());
    }

    #[test]
    fn rapid_commit_leaves_empty_advertise() {
        let mut handler = RapidCommitHandler {
            rapid_commit_rejections: false,
        };

        let mut bundle = request_bundle(MessageType::Solicit, vec![DhcpOption::RapidCommit]);
        bundle.allow_rapid_commit = true;
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));

        handler.post(&mut bundle).unwrap();
        assert_eq!(
            bundle.response.as_ref().unwrap().message_type,
            MessageType::Advertise
        );
    }

    #[test]
    fn renew_echoes_zero_lifetimes() {
        let mut handler = UnansweredIaHandler;

        let mut ia = IaNaOption::new(9);
        ia.options.push(DhcpOption::IaAddress(IaAddressOption::new(
            "2001:db8::42".parse().unwrap(),
            375,
            600,
        )));

        let mut bundle = request_bundle(MessageType::Renew, vec![DhcpOption::IaNa(ia)]);
        bundle.response = Some(ClientServerMessage::new(MessageType::Reply, [1, 2, 3]));

        handler.handle(&mut bundle).unwrap();

        let response = bundle.response.as_ref().unwrap();
        match &response.options[0] {
            DhcpOption::IaNa(answer) => {
                assert_eq!(answer.iaid, 9);
                let addresses: Vec<_> = answer.addresses().collect();
                assert_eq!(addresses.len(), 1);
                assert_eq!(addresses[0].preferred_lifetime, 0);
                assert_eq!(addresses[0].valid_lifetime, 0);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn solicit_gets_no_addrs_avail() {
        let mut handler = UnansweredIaHandler;

        let mut bundle = request_bundle(
            MessageType::Solicit,
            vec![DhcpOption::IaNa(IaNaOption::new(3))],
        );
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));

        handler.handle(&mut bundle).unwrap();

        let response = bundle.response.as_ref().unwrap();
        match &response.options[0] {
            DhcpOption::IaNa(answer) => {
                assert_eq!(answer.status_code().unwrap().status_code, STATUS_NO_ADDRS_AVAIL);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn handled_ia_is_left_alone() {
        let mut handler = UnansweredIaHandler;

        let ia = DhcpOption::IaNa(IaNaOption::new(3));
        let mut bundle = request_bundle(MessageType::Solicit, vec![ia.clone()]);
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));
        bundle.mark_handled(&ia);

        handler.handle(&mut bundle).unwrap();
        assert!(bundle.response.as_ref().unwrap().options.is_empty());
    }

    #[test]
    fn release_gets_success_status() {
        let mut handler = AddMissingStatusHandler;

        let mut bundle = request_bundle(MessageType::Release, vec![]);
        bundle.response = Some(ClientServerMessage::new(MessageType::Reply, [1, 2, 3]));

        handler.handle(&mut bundle).unwrap();
        assert_eq!(
            bundle
                .response
                .as_ref()
                .unwrap()
                .status_code()
                .unwrap()
                .status_code,
            STATUS_SUCCESS
        );
    }
}
