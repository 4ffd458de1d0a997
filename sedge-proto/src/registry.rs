//! Registries mapping wire type codes to element decoders.
//!
//! Each element category (options, messages, DUIDs, NTP sub-options) has a
//! process-wide registry built exactly once and read-only afterwards. The
//! parsers look codes up here, so the set of understood elements is a
//! property of the registration lists, not of the parser code. Codes without
//! an entry decode to the category's `Unknown` variant.
//!
//! Besides the code mapping, every registered class gets a normalized name:
//! the class name with its category suffix stripped and CamelCase folded to
//! dash-case (`IANAOption` -> `iana`, `LeasequeryReplyMessage` ->
//! `leasequery-reply`). Configuration sections and the statistics export
//! refer to elements by these names.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::bytes::BytesIn;
use crate::duid::{Duid, DUID_EN, DUID_LL, DUID_LLT};
use crate::options::ntp::NtpSubOption;
use crate::options::DhcpOption;
use crate::Error;

pub type OptionDecoder = fn(&mut BytesIn<'_>) -> Result<DhcpOption, Error>;
pub type DuidDecoder = fn(u16, &mut BytesIn<'_>) -> Result<Duid, Error>;
pub type NtpSubOptionDecoder = fn(&mut BytesIn<'_>) -> Result<NtpSubOption, Error>;

/// CamelCase to dash-case, with the category suffix stripped:
/// `normalized_name("IANAOption", "Option")` is `"iana"`.
pub fn normalized_name(class_name: &str, suffix: &str) -> String {
    let base = class_name.strip_suffix(suffix).unwrap_or(class_name);
    let chars: Vec<char> = base.chars().collect();

    let mut out = String::with_capacity(base.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_is_lower = i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let starts_word = i > 0
                && chars[i - 1].is_ascii_uppercase()
                && i + 1 < chars.len()
                && chars[i + 1].is_ascii_lowercase();

            if prev_is_lower || starts_word {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }

    out
}

pub struct OptionRegistry {
    decoders: HashMap<u16, OptionDecoder>,
    class_names: HashMap<u16, &'static str>,
    by_name: HashMap<String, u16>,
}

impl OptionRegistry {
    fn new() -> Self {
        Self {
            decoders: HashMap::new(),
            class_names: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a decoder for a type code. A later registration for the same
    /// code silently replaces the earlier one.
    pub fn register(&mut self, code: u16, class_name: &'static str, decoder: OptionDecoder) {
        self.decoders.insert(code, decoder);
        self.class_names.insert(code, class_name);
        self.by_name.insert(normalized_name(class_name, "Option"), code);
    }

    pub fn decoder(&self, code: u16) -> Option<OptionDecoder> {
        self.decoders.get(&code).copied()
    }

    pub fn name(&self, code: u16) -> Option<&'static str> {
        self.class_names.get(&code).copied()
    }

    pub fn code_by_name(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn is_known(&self, code: u16) -> bool {
        self.decoders.contains_key(&code)
    }
}

pub struct MessageRegistry {
    class_names: HashMap<u8, &'static str>,
    by_name: HashMap<String, u8>,
}

impl MessageRegistry {
    fn new() -> Self {
        Self {
            class_names: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, code: u8, class_name: &'static str) {
        self.class_names.insert(code, class_name);
        self.by_name.insert(normalized_name(class_name, "Message"), code);
    }

    pub fn is_known(&self, code: u8) -> bool {
        self.class_names.contains_key(&code)
    }

    pub fn name(&self, code: u8) -> Option<&'static str> {
        self.class_names.get(&code).copied()
    }

    pub fn code_by_name(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    /// All registered message codes, ascending. The statistics counters are
    /// laid out in this order.
    pub fn codes(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.class_names.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

pub struct DuidRegistry {
    decoders: HashMap<u16, DuidDecoder>,
    class_names: HashMap<u16, &'static str>,
}

impl DuidRegistry {
    fn new() -> Self {
        Self {
            decoders: HashMap::new(),
            class_names: HashMap::new(),
        }
    }

    pub fn register(&mut self, code: u16, class_name: &'static str, decoder: DuidDecoder) {
        self.decoders.insert(code, decoder);
        self.class_names.insert(code, class_name);
    }

    pub fn decoder(&self, code: u16) -> Option<DuidDecoder> {
        self.decoders.get(&code).copied()
    }

    pub fn name(&self, code: u16) -> Option<&'static str> {
        self.class_names.get(&code).copied()
    }
}

pub struct NtpSubOptionRegistry {
    decoders: HashMap<u16, NtpSubOptionDecoder>,
    class_names: HashMap<u16, &'static str>,
}

impl NtpSubOptionRegistry {
    fn new() -> Self {
        Self {
            decoders: HashMap::new(),
            class_names: HashMap::new(),
        }
    }

    pub fn register(&mut self, code: u16, class_name: &'static str, decoder: NtpSubOptionDecoder) {
        self.decoders.insert(code, decoder);
        self.class_names.insert(code, class_name);
    }

    pub fn decoder(&self, code: u16) -> Option<NtpSubOptionDecoder> {
        self.decoders.get(&code).copied()
    }

    pub fn name(&self, code: u16) -> Option<&'static str> {
        self.class_names.get(&code).copied()
    }
}

static OPTIONS: OnceLock<OptionRegistry> = OnceLock::new();
static MESSAGES: OnceLock<MessageRegistry> = OnceLock::new();
static DUIDS: OnceLock<DuidRegistry> = OnceLock::new();
static NTP_SUBOPTIONS: OnceLock<NtpSubOptionRegistry> = OnceLock::new();

pub fn options() -> &'static OptionRegistry {
    OPTIONS.get_or_init(build_option_registry)
}

pub fn messages() -> &'static MessageRegistry {
    MESSAGES.get_or_init(build_message_registry)
}

pub fn duids() -> &'static DuidRegistry {
    DUIDS.get_or_init(build_duid_registry)
}

pub fn ntp_suboptions() -> &'static NtpSubOptionRegistry {
    NTP_SUBOPTIONS.get_or_init(build_ntp_suboption_registry)
}

fn build_option_registry() -> OptionRegistry {
    use crate::options::*;

    let mut registry = OptionRegistry::new();

    // RFC 8415
    registry.register(OPTION_CLIENTID, "ClientIdOption", decode_client_id);
    registry.register(OPTION_SERVERID, "ServerIdOption", decode_server_id);
    registry.register(OPTION_IA_NA, "IANAOption", decode_ia_na);
    registry.register(OPTION_IA_TA, "IATAOption", decode_ia_ta);
    registry.register(OPTION_IAADDR, "IAAddressOption", decode_ia_address);
    registry.register(OPTION_ORO, "OptionRequestOption", decode_oro);
    registry.register(OPTION_PREFERENCE, "PreferenceOption", decode_preference);
    registry.register(OPTION_ELAPSED_TIME, "ElapsedTimeOption", decode_elapsed_time);
    registry.register(OPTION_RELAY_MSG, "RelayMessageOption", decode_relay_message);
    registry.register(OPTION_AUTH, "AuthenticationOption", decode_auth);
    registry.register(OPTION_UNICAST, "ServerUnicastOption", decode_unicast);
    registry.register(OPTION_STATUS_CODE, "StatusCodeOption", decode_status_code);
    registry.register(OPTION_RAPID_COMMIT, "RapidCommitOption", decode_rapid_commit);
    registry.register(OPTION_USER_CLASS, "UserClassOption", decode_user_class);
    registry.register(OPTION_VENDOR_CLASS, "VendorClassOption", decode_vendor_class);
    registry.register(
        OPTION_VENDOR_OPTS,
        "VendorSpecificInformationOption",
        decode_vendor_opts,
    );
    registry.register(OPTION_INTERFACE_ID, "InterfaceIdOption", decode_interface_id);
    registry.register(OPTION_RECONF_MSG, "ReconfigureMessageOption", decode_reconf_msg);
    registry.register(
        OPTION_RECONF_ACCEPT,
        "ReconfigureAcceptOption",
        decode_reconf_accept,
    );
    registry.register(OPTION_IA_PD, "IAPDOption", decode_ia_pd);
    registry.register(OPTION_IAPREFIX, "IAPrefixOption", decode_ia_prefix);
    registry.register(
        OPTION_INFORMATION_REFRESH_TIME,
        "InformationRefreshTimeOption",
        decode_information_refresh_time,
    );

    // RFC 3319
    registry.register(
        OPTION_SIP_SERVER_D,
        "SIPServersDomainNameListOption",
        decode_sip_server_d,
    );
    registry.register(
        OPTION_SIP_SERVER_A,
        "SIPServersAddressListOption",
        decode_sip_server_a,
    );

    // RFC 3646
    registry.register(
        OPTION_DNS_SERVERS,
        "RecursiveNameServersOption",
        decode_dns_servers,
    );
    registry.register(OPTION_DOMAIN_LIST, "DomainSearchListOption", decode_domain_list);

    // RFC 4075
    registry.register(OPTION_SNTP_SERVERS, "SNTPServersOption", decode_sntp_servers);

    // RFC 4649 / RFC 4580
    registry.register(OPTION_REMOTE_ID, "RemoteIdOption", decode_remote_id);
    registry.register(OPTION_SUBSCRIBER_ID, "SubscriberIdOption", decode_subscriber_id);

    // RFC 4704
    registry.register(OPTION_CLIENT_FQDN, "ClientFQDNOption", decode_client_fqdn);

    // RFC 4994
    registry.register(OPTION_ERO, "EchoRequestOption", decode_echo_request);

    // RFC 5007
    registry.register(OPTION_LQ_QUERY, "LQQueryOption", decode_lq_query);
    registry.register(OPTION_CLIENT_DATA, "ClientDataOption", decode_client_data);
    registry.register(OPTION_CLT_TIME, "CLTTimeOption", decode_clt_time);
    registry.register(OPTION_LQ_RELAY_DATA, "LQRelayDataOption", decode_lq_relay_data);
    registry.register(OPTION_LQ_CLIENT_LINK, "LQClientLinkOption", decode_lq_client_link);

    // RFC 5460
    registry.register(OPTION_RELAY_ID, "RelayIdOption", decode_relay_id);

    // RFC 5908
    registry.register(OPTION_NTP_SERVER, "NTPServersOption", decode_ntp_server);

    // RFC 6334
    registry.register(OPTION_AFTR_NAME, "AFTRNameOption", decode_aftr_name);

    // RFC 6603
    registry.register(OPTION_PD_EXCLUDE, "PDExcludeOption", decode_pd_exclude);

    // RFC 6939
    registry.register(
        OPTION_CLIENT_LINKLAYER_ADDR,
        "LinkLayerIdOption",
        decode_linklayer_id,
    );

    // RFC 7083
    registry.register(OPTION_SOL_MAX_RT, "SolMaxRTOption", decode_sol_max_rt);
    registry.register(OPTION_INF_MAX_RT, "InfMaxRTOption", decode_inf_max_rt);

    registry
}

fn build_message_registry() -> MessageRegistry {
    use crate::message::*;

    let mut registry = MessageRegistry::new();

    registry.register(MSG_SOLICIT, "SolicitMessage");
    registry.register(MSG_ADVERTISE, "AdvertiseMessage");
    registry.register(MSG_REQUEST, "RequestMessage");
    registry.register(MSG_CONFIRM, "ConfirmMessage");
    registry.register(MSG_RENEW, "RenewMessage");
    registry.register(MSG_REBIND, "RebindMessage");
    registry.register(MSG_REPLY, "ReplyMessage");
    registry.register(MSG_RELEASE, "ReleaseMessage");
    registry.register(MSG_DECLINE, "DeclineMessage");
    registry.register(MSG_RECONFIGURE, "ReconfigureMessage");
    registry.register(MSG_INFORMATION_REQUEST, "InformationRequestMessage");
    registry.register(MSG_RELAY_FORW, "RelayForwardMessage");
    registry.register(MSG_RELAY_REPL, "RelayReplyMessage");
    registry.register(MSG_LEASEQUERY, "LeasequeryMessage");
    registry.register(MSG_LEASEQUERY_REPLY, "LeasequeryReplyMessage");
    registry.register(MSG_LEASEQUERY_DONE, "LeasequeryDoneMessage");
    registry.register(MSG_LEASEQUERY_DATA, "LeasequeryDataMessage");

    registry
}

fn build_duid_registry() -> DuidRegistry {
    let mut registry = DuidRegistry::new();

    registry.register(DUID_LLT, "LinkLayerTimeDUID", Duid::parse_llt);
    registry.register(DUID_EN, "EnterpriseDUID", Duid::parse_en);
    registry.register(DUID_LL, "LinkLayerDUID", Duid::parse_ll);

    registry
}

fn build_ntp_suboption_registry() -> NtpSubOptionRegistry {
    use crate::options::ntp::*;

    let mut registry = NtpSubOptionRegistry::new();

    registry.register(
        NTP_SUBOPTION_SRV_ADDR,
        "NTPServerAddressSubOption",
        NtpSubOption::parse_srv_addr,
    );
    registry.register(
        NTP_SUBOPTION_MC_ADDR,
        "NTPMulticastAddressSubOption",
        NtpSubOption::parse_mc_addr,
    );
    registry.register(
        NTP_SUBOPTION_SRV_FQDN,
        "NTPServerFQDNSubOption",
        NtpSubOption::parse_srv_fqdn,
    );

    registry
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_normalize() {
        assert_eq!(normalized_name("ClientIdOption", "Option"), "client-id");
        assert_eq!(normalized_name("IANAOption", "Option"), "iana");
        assert_eq!(normalized_name("CLTTimeOption", "Option"), "clt-time");
        assert_eq!(normalized_name("LQQueryOption", "Option"), "lq-query");
        assert_eq!(normalized_name("SolMaxRTOption", "Option"), "sol-max-rt");
        assert_eq!(
            normalized_name("SIPServersDomainNameListOption", "Option"),
            "sip-servers-domain-name-list"
        );
        assert_eq!(
            normalized_name("LeasequeryReplyMessage", "Message"),
            "leasequery-reply"
        );
        assert_eq!(normalized_name("LinkLayerTimeDUID", "DUID"), "link-layer-time");
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(options().code_by_name("iana"), Some(crate::options::OPTION_IA_NA));
        assert_eq!(
            options().code_by_name("recursive-name-servers"),
            Some(crate::options::OPTION_DNS_SERVERS)
        );
        assert_eq!(options().code_by_name("no-such-option"), None);
        assert_eq!(
            messages().code_by_name("solicit"),
            Some(crate::message::MSG_SOLICIT)
        );
    }

    #[test]
    fn unknown_codes_have_no_decoder() {
        assert!(options().decoder(0x4242).is_none());
        assert!(!messages().is_known(200));
        assert!(duids().decoder(0x534a).is_none());
    }

    #[test]
    fn replacement_is_silent() {
        let mut registry = OptionRegistry::new();
        registry.register(1, "ClientIdOption", crate::options::decode_client_id);
        registry.register(1, "ServerIdOption", crate::options::decode_server_id);
        assert_eq!(registry.name(1), Some("ServerIdOption"));
    }
}
