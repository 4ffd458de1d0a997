//! Building-block handlers: copy an option from the request, overwrite an
//! option in the response, drop a request, attach a mark.

use log::info;

use sedge_proto::grammar;
use sedge_proto::options::DhcpOption;

use crate::bundle::TransactionBundle;
use crate::handlers::{Handler, HandlerError, HandlerResult};

/// Copies all request options of one code into the response, replacing
/// whatever is already there.
pub struct CopyOptionHandler {
    name: &'static str,
    code: u16,
    always_send: bool,
}

impl CopyOptionHandler {
    pub fn new(name: &'static str, code: u16, always_send: bool) -> Self {
        Self {
            name,
            code,
            always_send,
        }
    }
}

impl Handler for CopyOptionHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        let Some(response) = &bundle.response else {
            return Ok(());
        };

        if !grammar::message_allows_option(response.message_type, self.code) {
            return Ok(());
        }

        if !self.always_send && !requested(request.option_request(), self.code) {
            return Ok(());
        }

        let copies: Vec<DhcpOption> = request.options_of_code(self.code).cloned().collect();
        if copies.is_empty() {
            return Ok(());
        }

        let response = bundle.response.as_mut().expect("checked above");
        response.options.retain(|option| option.code() != self.code);
        response.options.splice(0..0, copies);

        Ok(())
    }
}

/// Puts one fixed option into the response, replacing any existing instance
/// of the same code. This is what the `option <name>` configuration sections
/// produce.
pub struct SimpleOptionHandler {
    name: &'static str,
    option: DhcpOption,
    always_send: bool,
}

impl SimpleOptionHandler {
    pub fn new(name: &'static str, option: DhcpOption, always_send: bool) -> Self {
        Self {
            name,
            option,
            always_send,
        }
    }
}

impl Handler for SimpleOptionHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        insert_options(
            bundle,
            std::slice::from_ref(&self.option),
            self.always_send,
        );
        Ok(())
    }
}

/// Like [`SimpleOptionHandler`] for configuration sections that expand into
/// more than one wire option (SIP servers have separate name-list and
/// address-list options).
pub struct MultiOptionHandler {
    name: &'static str,
    options: Vec<DhcpOption>,
    always_send: bool,
}

impl MultiOptionHandler {
    pub fn new(name: &'static str, options: Vec<DhcpOption>, always_send: bool) -> Self {
        Self {
            name,
            options,
            always_send,
        }
    }
}

impl Handler for MultiOptionHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        insert_options(bundle, &self.options, self.always_send);
        Ok(())
    }
}

fn insert_options(bundle: &mut TransactionBundle, options: &[DhcpOption], always_send: bool) {
    let Some(request) = &bundle.request else {
        return;
    };
    let requested_codes = request.option_request().map(|codes| codes.to_vec());

    let Some(response) = bundle.response.as_mut() else {
        return;
    };

    for option in options {
        let code = option.code();

        if !grammar::message_allows_option(response.message_type, code) {
            continue;
        }

        if !always_send && !requested(requested_codes.as_deref(), code) {
            continue;
        }

        response.options.retain(|existing| existing.code() != code);
        response.options.insert(0, option.clone());
    }
}

fn requested(oro: Option<&[u16]>, code: u16) -> bool {
    // No option-request option means the client takes anything
    oro.map_or(true, |codes| codes.contains(&code))
}

/// Drops the request. Usually placed under a filter to silence a subset of
/// clients.
pub struct IgnoreRequestHandler;

impl Handler for IgnoreRequestHandler {
    fn name(&self) -> &'static str {
        "ignore"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        info!("Configured to ignore {}", bundle.describe());
        Err(HandlerError::cannot_respond("Ignoring request"))
    }
}

/// Attaches a mark so later filters can select on it.
pub struct MarkHandler {
    mark: String,
}

impl MarkHandler {
    pub fn new(mark: &str) -> Self {
        Self {
            mark: mark.to_string(),
        }
    }
}

impl Handler for MarkHandler {
    fn name(&self) -> &'static str {
        "mark"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        bundle.add_mark(&self.mark);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::message::{ClientServerMessage, Message, MessageType};
    use sedge_proto::options::OPTION_DNS_SERVERS;

    fn bundle_with_response(request_options: Vec<DhcpOption>) -> TransactionBundle {
        let mut request = ClientServerMessage::new(MessageType::Request, [1, 2, 3]);
        request.options = request_options;

        let mut bundle = TransactionBundle::new(Message::ClientServer(request), true, false);
        bundle.response = Some(ClientServerMessage::new(MessageType::Reply, [1, 2, 3]));
        bundle
    }

    fn dns_option() -> DhcpOption {
        DhcpOption::RecursiveNameServers(vec!["2001:4860:4860::8888".parse().unwrap()])
    }

    #[test]
    fn simple_option_respects_oro() {
        let mut handler = SimpleOptionHandler::new("dns", dns_option(), false);

        // client did not ask for DNS servers
        let mut bundle = bundle_with_response(vec![DhcpOption::OptionRequest(vec![82])]);
        handler.handle(&mut bundle).unwrap();
        assert!(bundle.response.as_ref().unwrap().options.is_empty());

        // client asked
        let mut bundle =
            bundle_with_response(vec![DhcpOption::OptionRequest(vec![OPTION_DNS_SERVERS])]);
        handler.handle(&mut bundle).unwrap();
        assert_eq!(bundle.response.as_ref().unwrap().options.len(), 1);

        // no ORO at all counts as "send it"
        let mut bundle = bundle_with_response(vec![]);
        handler.handle(&mut bundle).unwrap();
        assert_eq!(bundle.response.as_ref().unwrap().options.len(), 1);
    }

    #[test]
    fn always_send_overrides_oro() {
        let mut handler = SimpleOptionHandler::new("dns", dns_option(), true);
        let mut bundle = bundle_with_response(vec![DhcpOption::OptionRequest(vec![82])]);
        handler.handle(&mut bundle).unwrap();
        assert_eq!(bundle.response.as_ref().unwrap().options.len(), 1);
    }

    #[test]
    fn overwrite_replaces_existing() {
        let mut handler = SimpleOptionHandler::new("dns", dns_option(), true);
        let mut bundle = bundle_with_response(vec![]);
        bundle
            .response
            .as_mut()
            .unwrap()
            .options
            .push(DhcpOption::RecursiveNameServers(vec!["::1".parse().unwrap()]));

        handler.handle(&mut bundle).unwrap();
        let response = bundle.response.as_ref().unwrap();
        assert_eq!(response.options.len(), 1);
        assert_eq!(response.options[0], dns_option());
    }
}
