//! The containment grammar: which element classes may appear inside which,
//! and how often.
//!
//! The table is flat: one `(parent kind, child kind) -> (min, max)` mapping
//! built once at startup. Wildcard child kinds (`AnyOption`, `AnyMessage`,
//! `AnyNtpSubOption`) catch classes without a specific rule, so unknown
//! options inside a parsed message never fail validation by themselves.
//! Classification prefers the most specific kind: a status-code option
//! inside an IA_NA counts against the `StatusCode (0,1)` rule, not against
//! the wildcard.
//!
//! Parsers never consult this table. Only `validate()` does, so malformed
//! or rule-breaking packets can still be parsed and inspected.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::message::{Message, MSG_RELAY_FORW};
use crate::options::DhcpOption;
use crate::registry;
use crate::Error;

/// No upper bound on occurrence.
pub const UNBOUNDED: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// A concrete message type.
    Message(u8),
    /// Any message, of either family.
    AnyMessage,
    /// A concrete option code.
    Option(u16),
    /// Any option.
    AnyOption,
    /// A concrete NTP sub-option code.
    NtpSubOption(u16),
    /// Any NTP sub-option.
    AnyNtpSubOption,
}

impl ElementKind {
    fn name(self) -> &'static str {
        match self {
            Self::Message(code) => registry::messages().name(code).unwrap_or("UnknownMessage"),
            Self::AnyMessage => "Message",
            Self::Option(code) => registry::options().name(code).unwrap_or("UnknownOption"),
            Self::AnyOption => "Option",
            Self::NtpSubOption(code) => registry::ntp_suboptions()
                .name(code)
                .unwrap_or("UnknownNTPSubOption"),
            Self::AnyNtpSubOption => "NTPSubOption",
        }
    }
}

pub struct Grammar {
    rules: HashMap<ElementKind, Vec<(ElementKind, (u32, u32))>>,
}

impl Grammar {
    fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    fn may_contain(&mut self, parent: ElementKind, child: ElementKind, min: u32, max: u32) {
        self.rules.entry(parent).or_default().push((child, (min, max)));
    }

    /// Whether `parent` accepts a child classifying under `child_kinds`.
    pub fn allows(&self, parent: ElementKind, child_kinds: &[ElementKind]) -> bool {
        let Some(rules) = self.rules.get(&parent) else {
            return false;
        };

        for kind in child_kinds {
            if let Some((_, (_, max))) = rules.iter().find(|(rule_kind, _)| rule_kind == kind) {
                return *max > 0;
            }
        }

        false
    }

    /// Count `children` against the rules of `parent`.
    ///
    /// Every child must classify under some rule (specific kind first, then
    /// a wildcard); every rule's `(min, max)` must hold for the number of
    /// children that classified under it.
    pub fn validate_contains<'c>(
        &self,
        parent: ElementKind,
        children: impl Iterator<Item = &'c [ElementKind]>,
    ) -> Result<(), Error> {
        let Some(rules) = self.rules.get(&parent) else {
            // No rules registered: nothing to check
            return Ok(());
        };

        let mut counters: HashMap<ElementKind, u32> = HashMap::new();
        for kinds in children {
            let classified = kinds
                .iter()
                .find(|kind| rules.iter().any(|(rule_kind, _)| rule_kind == *kind));

            match classified {
                Some(kind) => *counters.entry(*kind).or_insert(0) += 1,
                None => {
                    return Err(Error::MayNotContain {
                        parent: parent.name(),
                        child: kinds.first().map(|kind| kind.name()).unwrap_or("element"),
                    })
                }
            }
        }

        for (kind, (min, max)) in rules {
            let count = counters.get(kind).copied().unwrap_or(0);
            if count < *min || count > *max {
                return Err(Error::Containment {
                    parent: parent.name(),
                    child: kind.name(),
                    count: count as usize,
                    min: *min,
                    max: *max,
                });
            }
        }

        Ok(())
    }
}

/// Classification chain of an option: its own code, then the wildcard.
fn option_kinds(option: &DhcpOption) -> [ElementKind; 2] {
    [ElementKind::Option(option.code()), ElementKind::AnyOption]
}

fn message_kinds(message: &Message) -> [ElementKind; 2] {
    [
        ElementKind::Message(u8::from(message.message_type())),
        ElementKind::AnyMessage,
    ]
}

pub fn table() -> &'static Grammar {
    GRAMMAR.get_or_init(build)
}

/// Whether a message of the given type may carry the given option.
pub fn message_allows_option(message_type: crate::message::MessageType, code: u16) -> bool {
    table().allows(
        ElementKind::Message(u8::from(message_type)),
        &[ElementKind::Option(code), ElementKind::AnyOption],
    )
}

pub(crate) fn validate_message(message: &Message) -> Result<(), Error> {
    if matches!(message, Message::Unknown(_)) {
        return Ok(());
    }

    let parent = ElementKind::Message(u8::from(message.message_type()));
    let kinds: Vec<[ElementKind; 2]> = message.options().iter().map(option_kinds).collect();

    table().validate_contains(parent, kinds.iter().map(|kinds| &kinds[..]))
}

pub(crate) fn validate_option(option: &DhcpOption) -> Result<(), Error> {
    let parent = ElementKind::Option(option.code());

    let kinds: Vec<[ElementKind; 2]> = match option {
        DhcpOption::RelayMessage(message) => vec![message_kinds(message)],
        DhcpOption::LqRelayData(relay_data) => vec![message_kinds(&relay_data.relay_message)],
        DhcpOption::NtpServer(suboptions) => suboptions
            .iter()
            .map(|suboption| {
                [
                    ElementKind::NtpSubOption(suboption.code()),
                    ElementKind::AnyNtpSubOption,
                ]
            })
            .collect(),
        _ => option.sub_options().iter().map(option_kinds).collect(),
    };

    table().validate_contains(parent, kinds.iter().map(|kinds| &kinds[..]))
}

static GRAMMAR: OnceLock<Grammar> = OnceLock::new();

fn build() -> Grammar {
    use crate::message::*;
    use crate::options::*;

    let mut g = Grammar::new();

    let msg = ElementKind::Message;
    let opt = ElementKind::Option;

    // Client/server messages. Every message accepts arbitrary additional
    // options (extensions, unknown codes); the specific rules pin down the
    // structurally important ones.
    for code in [
        MSG_SOLICIT,
        MSG_ADVERTISE,
        MSG_REQUEST,
        MSG_CONFIRM,
        MSG_RENEW,
        MSG_REBIND,
        MSG_REPLY,
        MSG_RELEASE,
        MSG_DECLINE,
        MSG_RECONFIGURE,
        MSG_INFORMATION_REQUEST,
        MSG_LEASEQUERY,
        MSG_LEASEQUERY_REPLY,
        MSG_LEASEQUERY_DONE,
        MSG_LEASEQUERY_DATA,
    ] {
        g.may_contain(msg(code), ElementKind::AnyOption, 0, UNBOUNDED);
    }

    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_SERVERID), 0, 0);
    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_ORO), 0, 1);
    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_ELAPSED_TIME), 0, 1);
    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_RAPID_COMMIT), 0, 1);
    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_RECONF_ACCEPT), 0, 1);
    g.may_contain(msg(MSG_SOLICIT), opt(OPTION_USER_CLASS), 0, 1);

    g.may_contain(msg(MSG_ADVERTISE), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_ADVERTISE), opt(OPTION_SERVERID), 1, 1);
    g.may_contain(msg(MSG_ADVERTISE), opt(OPTION_STATUS_CODE), 0, 1);
    g.may_contain(msg(MSG_ADVERTISE), opt(OPTION_PREFERENCE), 0, 1);
    g.may_contain(msg(MSG_ADVERTISE), opt(OPTION_RECONF_ACCEPT), 0, 1);

    g.may_contain(msg(MSG_REQUEST), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_REQUEST), opt(OPTION_SERVERID), 1, 1);
    g.may_contain(msg(MSG_REQUEST), opt(OPTION_ORO), 0, 1);
    g.may_contain(msg(MSG_REQUEST), opt(OPTION_ELAPSED_TIME), 0, 1);
    g.may_contain(msg(MSG_REQUEST), opt(OPTION_RECONF_ACCEPT), 0, 1);

    g.may_contain(msg(MSG_CONFIRM), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_CONFIRM), opt(OPTION_SERVERID), 0, 0);
    g.may_contain(msg(MSG_CONFIRM), opt(OPTION_ORO), 0, 1);
    g.may_contain(msg(MSG_CONFIRM), opt(OPTION_ELAPSED_TIME), 0, 1);

    g.may_contain(msg(MSG_RENEW), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_RENEW), opt(OPTION_SERVERID), 1, 1);
    g.may_contain(msg(MSG_RENEW), opt(OPTION_ORO), 0, 1);
    g.may_contain(msg(MSG_RENEW), opt(OPTION_ELAPSED_TIME), 0, 1);
    g.may_contain(msg(MSG_RENEW), opt(OPTION_RECONF_ACCEPT), 0, 1);

    g.may_contain(msg(MSG_REBIND), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_REBIND), opt(OPTION_SERVERID), 0, 0);
    g.may_contain(msg(MSG_REBIND), opt(OPTION_ORO), 0, 1);
    g.may_contain(msg(MSG_REBIND), opt(OPTION_ELAPSED_TIME), 0, 1);
    g.may_contain(msg(MSG_REBIND), opt(OPTION_RECONF_ACCEPT), 0, 1);

    g.may_contain(msg(MSG_REPLY), opt(OPTION_CLIENTID), 0, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_SERVERID), 1, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_STATUS_CODE), 0, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_PREFERENCE), 0, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_UNICAST), 0, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_RAPID_COMMIT), 0, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_RECONF_ACCEPT), 0, 1);
    g.may_contain(msg(MSG_REPLY), opt(OPTION_INFORMATION_REFRESH_TIME), 0, 1);

    for code in [MSG_RELEASE, MSG_DECLINE] {
        g.may_contain(msg(code), opt(OPTION_CLIENTID), 1, 1);
        g.may_contain(msg(code), opt(OPTION_SERVERID), 1, 1);
        g.may_contain(msg(code), opt(OPTION_ELAPSED_TIME), 0, 1);
    }

    g.may_contain(msg(MSG_RECONFIGURE), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_RECONFIGURE), opt(OPTION_SERVERID), 1, 1);
    g.may_contain(msg(MSG_RECONFIGURE), opt(OPTION_RECONF_MSG), 1, 1);
    g.may_contain(msg(MSG_RECONFIGURE), opt(OPTION_ORO), 0, 1);

    g.may_contain(msg(MSG_INFORMATION_REQUEST), opt(OPTION_CLIENTID), 0, 1);
    g.may_contain(msg(MSG_INFORMATION_REQUEST), opt(OPTION_SERVERID), 0, 1);
    g.may_contain(msg(MSG_INFORMATION_REQUEST), opt(OPTION_ORO), 0, 1);
    g.may_contain(msg(MSG_INFORMATION_REQUEST), opt(OPTION_ELAPSED_TIME), 0, 1);

    g.may_contain(msg(MSG_LEASEQUERY), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_LEASEQUERY), opt(OPTION_SERVERID), 0, 1);
    g.may_contain(msg(MSG_LEASEQUERY), opt(OPTION_LQ_QUERY), 1, 1);

    g.may_contain(msg(MSG_LEASEQUERY_REPLY), opt(OPTION_CLIENTID), 1, 1);
    g.may_contain(msg(MSG_LEASEQUERY_REPLY), opt(OPTION_SERVERID), 1, 1);
    g.may_contain(msg(MSG_LEASEQUERY_REPLY), opt(OPTION_CLIENT_DATA), 0, 1);

    g.may_contain(msg(MSG_LEASEQUERY_DONE), opt(OPTION_STATUS_CODE), 0, 1);
    g.may_contain(msg(MSG_LEASEQUERY_DATA), opt(OPTION_CLIENT_DATA), 0, 1);

    // Relay messages
    for code in [MSG_RELAY_FORW, MSG_RELAY_REPL] {
        g.may_contain(msg(code), ElementKind::AnyOption, 0, UNBOUNDED);
        g.may_contain(msg(code), opt(OPTION_RELAY_MSG), 1, 1);
        g.may_contain(msg(code), opt(OPTION_INTERFACE_ID), 0, 1);
        g.may_contain(msg(code), opt(OPTION_SUBSCRIBER_ID), 0, 1);
        g.may_contain(msg(code), opt(OPTION_ERO), 0, 1);
        g.may_contain(msg(code), opt(OPTION_RELAY_ID), 0, 1);
        g.may_contain(msg(code), opt(OPTION_CLIENT_LINKLAYER_ADDR), 0, 1);
    }

    // Container options
    for code in [OPTION_IA_NA, OPTION_IA_TA] {
        g.may_contain(opt(code), opt(OPTION_IAADDR), 0, UNBOUNDED);
        g.may_contain(opt(code), opt(OPTION_STATUS_CODE), 0, 1);
        g.may_contain(opt(code), ElementKind::AnyOption, 0, UNBOUNDED);
    }

    g.may_contain(opt(OPTION_IA_PD), opt(OPTION_IAPREFIX), 0, UNBOUNDED);
    g.may_contain(opt(OPTION_IA_PD), opt(OPTION_STATUS_CODE), 0, 1);
    g.may_contain(opt(OPTION_IA_PD), ElementKind::AnyOption, 0, UNBOUNDED);

    g.may_contain(opt(OPTION_IAADDR), opt(OPTION_STATUS_CODE), 0, 1);
    g.may_contain(opt(OPTION_IAADDR), ElementKind::AnyOption, 0, UNBOUNDED);

    g.may_contain(opt(OPTION_IAPREFIX), opt(OPTION_PD_EXCLUDE), 0, 1);
    g.may_contain(opt(OPTION_IAPREFIX), opt(OPTION_STATUS_CODE), 0, 1);
    g.may_contain(opt(OPTION_IAPREFIX), ElementKind::AnyOption, 0, UNBOUNDED);

    g.may_contain(opt(OPTION_RELAY_MSG), ElementKind::AnyMessage, 1, 1);

    g.may_contain(opt(OPTION_LQ_QUERY), opt(OPTION_IAADDR), 0, 1);
    g.may_contain(opt(OPTION_LQ_QUERY), opt(OPTION_CLIENTID), 0, 1);
    g.may_contain(opt(OPTION_LQ_QUERY), opt(OPTION_ORO), 0, 1);
    g.may_contain(opt(OPTION_LQ_QUERY), opt(OPTION_RELAY_ID), 0, 1);
    g.may_contain(opt(OPTION_LQ_QUERY), opt(OPTION_REMOTE_ID), 0, 1);
    g.may_contain(opt(OPTION_LQ_QUERY), ElementKind::AnyOption, 0, UNBOUNDED);

    g.may_contain(opt(OPTION_CLIENT_DATA), ElementKind::AnyOption, 0, UNBOUNDED);

    g.may_contain(opt(OPTION_LQ_RELAY_DATA), msg(MSG_RELAY_FORW), 1, 1);

    g.may_contain(opt(OPTION_NTP_SERVER), ElementKind::AnyNtpSubOption, 1, UNBOUNDED);

    g
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::duid::Duid;
    use crate::message::{ClientServerMessage, MessageType};
    use crate::options::ia::IaNaOption;
    use crate::options::StatusCodeOption;

    fn duid() -> Duid {
        Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![1, 2, 3, 4, 5, 6],
        }
    }

    #[test]
    fn solicit_needs_client_id() {
        let message = Message::ClientServer(ClientServerMessage::new(
            MessageType::Solicit,
            [0, 0, 1],
        ));
        assert!(matches!(
            message.validate(),
            Err(Error::Containment { child: "ClientIdOption", .. })
        ));

        let mut message = message;
        if let Message::ClientServer(inner) = &mut message {
            inner.options.push(DhcpOption::ClientId(duid()));
        }
        assert!(message.validate().is_ok());
    }

    #[test]
    fn solicit_rejects_server_id() {
        let mut inner = ClientServerMessage::new(MessageType::Solicit, [0, 0, 1]);
        inner.options.push(DhcpOption::ClientId(duid()));
        inner.options.push(DhcpOption::ServerId(duid()));
        let message = Message::ClientServer(inner);

        assert!(matches!(
            message.validate(),
            Err(Error::Containment { child: "ServerIdOption", count: 1, .. })
        ));
    }

    #[test]
    fn at_most_one_status_code_per_ia() {
        let mut ia = IaNaOption::new(1);
        ia.options
            .push(DhcpOption::StatusCode(StatusCodeOption::new(0, "ok")));
        ia.options
            .push(DhcpOption::StatusCode(StatusCodeOption::new(0, "ok again")));

        let option = DhcpOption::IaNa(ia);
        assert!(matches!(
            option.validate(),
            Err(Error::Containment { parent: "IANAOption", child: "StatusCodeOption", count: 2, .. })
        ));
    }

    #[test]
    fn unknown_options_are_tolerated() {
        let mut inner = ClientServerMessage::new(MessageType::Solicit, [0, 0, 1]);
        inner.options.push(DhcpOption::ClientId(duid()));
        inner.options.push(DhcpOption::Unknown {
            option_type: 0x4242,
            data: vec![1, 2, 3],
        });
        assert!(Message::ClientServer(inner).validate().is_ok());
    }

    #[test]
    fn relay_data_must_wrap_relay_forward() {
        use crate::options::LqRelayDataOption;

        let inner = Message::ClientServer(ClientServerMessage::new(
            MessageType::Reply,
            [0, 0, 1],
        ));
        let option = DhcpOption::LqRelayData(LqRelayDataOption {
            peer_address: "fe80::1".parse().unwrap(),
            relay_message: Box::new(inner),
        });

        assert!(matches!(option.validate(), Err(Error::MayNotContain { .. })));
    }
}
