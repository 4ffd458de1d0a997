//! Handlers that operate on the relay chain: per-hop option copying and
//! echo-request processing.

use log::error;

use sedge_proto::message::RelayMessage;
use sedge_proto::options::{DhcpOption, OPTION_INTERFACE_ID};

use crate::bundle::TransactionBundle;
use crate::handlers::{Handler, HandlerResult};

/// Walk the incoming and outgoing relay chains pairwise. The chains mirror
/// each other by construction; a length mismatch means some handler broke
/// the bundle and is only logged.
pub fn for_each_relay_pair(
    bundle: &mut TransactionBundle,
    mut f: impl FnMut(&RelayMessage, &mut RelayMessage),
) {
    if !bundle.incoming_relay_messages.is_empty() && bundle.outgoing_relay_messages.is_empty() {
        // handled requests have their reply chain from init_response on
        error!("Cannot process relay chains: outgoing chain not set");
        return;
    }

    if bundle.incoming_relay_messages.len() != bundle.outgoing_relay_messages.len() {
        error!("Cannot process relay chains: chains have different lengths");
        return;
    }

    let incoming = &bundle.incoming_relay_messages;
    let outgoing = &mut bundle.outgoing_relay_messages;
    for (relay_in, relay_out) in incoming.iter().zip(outgoing.iter_mut()) {
        f(relay_in, relay_out);
    }
}

/// Copies one option code from each incoming relay hop to the matching
/// outgoing hop, replacing anything already there.
pub struct CopyRelayOptionHandler {
    name: &'static str,
    code: u16,
}

impl CopyRelayOptionHandler {
    pub fn new(name: &'static str, code: u16) -> Self {
        Self { name, code }
    }
}

impl Handler for CopyRelayOptionHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if bundle.response.is_none() {
            return Ok(());
        }

        let code = self.code;
        for_each_relay_pair(bundle, |relay_in, relay_out| {
            let copies: Vec<DhcpOption> = relay_in.options_of_code(code).cloned().collect();
            if copies.is_empty() {
                return;
            }

            relay_out.options.retain(|option| option.code() != code);
            relay_out.options.splice(0..0, copies);
        });

        Ok(())
    }
}

/// Interface-id options pass through the relay chain unchanged so each relay
/// can recognise its own hop in the reply.
pub struct InterfaceIdOptionHandler {
    copy: CopyRelayOptionHandler,
}

impl InterfaceIdOptionHandler {
    pub fn new() -> Self {
        Self {
            copy: CopyRelayOptionHandler::new("interface-id", OPTION_INTERFACE_ID),
        }
    }
}

impl Default for InterfaceIdOptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for InterfaceIdOptionHandler {
    fn name(&self) -> &'static str {
        "interface-id"
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        self.copy.handle(bundle)
    }
}

/// RFC 4994 echo-request processing: for each option code a relay listed in
/// its echo-request option, copy that hop's instances of the option verbatim
/// into the reply hop. Codes already present in the reply hop, or absent
/// from the forward hop, are skipped.
pub struct RelayEchoRequestHandler;

impl Handler for RelayEchoRequestHandler {
    fn name(&self) -> &'static str {
        "relay-echo-request"
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if bundle.response.is_none() {
            return Ok(());
        }

        for_each_relay_pair(bundle, |relay_in, relay_out| {
            let requested = relay_in.options.iter().find_map(|option| match option {
                DhcpOption::EchoRequest(codes) => Some(codes.clone()),
                _ => None,
            });
            let Some(requested) = requested else {
                return;
            };

            for code in requested {
                if relay_out.options.iter().any(|option| option.code() == code) {
                    continue;
                }

                let copies: Vec<DhcpOption> =
                    relay_in.options_of_code(code).cloned().collect();
                relay_out.options.extend(copies);
            }
        });

        Ok(())
    }
}
