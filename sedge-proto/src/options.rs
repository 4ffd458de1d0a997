//! DHCPv6 options.
//!
//! Every option is a variant of [`DhcpOption`]; codes nobody registered a
//! decoder for land in [`DhcpOption::Unknown`] with their raw payload so
//! they survive a round trip byte for byte. Parsing picks the concrete
//! decoder through the option registry, which the process bootstrap fills by
//! calling [`crate::load_all_extensions`].
//!
//! Wire framing is always `option-code:u16, option-len:u16, payload`. The
//! occurrence rules (which option may appear where, and how often) live in
//! the containment grammar and are only checked by `validate()`, never
//! during parsing.

use core::net::Ipv6Addr;

use log::trace;

use crate::bytes::{BytesIn, BytesOut};
use crate::duid::Duid;
use crate::message::Message;
use crate::name::DomainName;
use crate::registry;
use crate::Error;

pub mod ia;
pub mod leasequery;
pub mod ntp;

pub use ia::{IaAddressOption, IaNaOption, IaPdOption, IaPrefixOption, IaTaOption};
pub use leasequery::{ClientDataOption, LqQueryOption, LqRelayDataOption};
pub use ntp::NtpSubOption;

// RFC 8415
pub const OPTION_CLIENTID: u16 = 1;
pub const OPTION_SERVERID: u16 = 2;
pub const OPTION_IA_NA: u16 = 3;
pub const OPTION_IA_TA: u16 = 4;
pub const OPTION_IAADDR: u16 = 5;
pub const OPTION_ORO: u16 = 6;
pub const OPTION_PREFERENCE: u16 = 7;
pub const OPTION_ELAPSED_TIME: u16 = 8;
pub const OPTION_RELAY_MSG: u16 = 9;
pub const OPTION_AUTH: u16 = 11;
pub const OPTION_UNICAST: u16 = 12;
pub const OPTION_STATUS_CODE: u16 = 13;
pub const OPTION_RAPID_COMMIT: u16 = 14;
pub const OPTION_USER_CLASS: u16 = 15;
pub const OPTION_VENDOR_CLASS: u16 = 16;
pub const OPTION_VENDOR_OPTS: u16 = 17;
pub const OPTION_INTERFACE_ID: u16 = 18;
pub const OPTION_RECONF_MSG: u16 = 19;
pub const OPTION_RECONF_ACCEPT: u16 = 20;
// RFC 3319
pub const OPTION_SIP_SERVER_D: u16 = 21;
pub const OPTION_SIP_SERVER_A: u16 = 22;
// RFC 3646
pub const OPTION_DNS_SERVERS: u16 = 23;
pub const OPTION_DOMAIN_LIST: u16 = 24;
// RFC 3633 (now RFC 8415)
pub const OPTION_IA_PD: u16 = 25;
pub const OPTION_IAPREFIX: u16 = 26;
// RFC 4075
pub const OPTION_SNTP_SERVERS: u16 = 31;
// RFC 8415
pub const OPTION_INFORMATION_REFRESH_TIME: u16 = 32;
// RFC 4649
pub const OPTION_REMOTE_ID: u16 = 37;
// RFC 4580
pub const OPTION_SUBSCRIBER_ID: u16 = 38;
// RFC 4994
pub const OPTION_ERO: u16 = 43;
// RFC 4704
pub const OPTION_CLIENT_FQDN: u16 = 39;
// RFC 5007
pub const OPTION_LQ_QUERY: u16 = 44;
pub const OPTION_CLIENT_DATA: u16 = 45;
pub const OPTION_CLT_TIME: u16 = 46;
pub const OPTION_LQ_RELAY_DATA: u16 = 47;
pub const OPTION_LQ_CLIENT_LINK: u16 = 48;
// RFC 5460
pub const OPTION_RELAY_ID: u16 = 53;
// RFC 5908
pub const OPTION_NTP_SERVER: u16 = 56;
// RFC 6334
pub const OPTION_AFTR_NAME: u16 = 64;
// RFC 6603
pub const OPTION_PD_EXCLUDE: u16 = 67;
// RFC 6939
pub const OPTION_CLIENT_LINKLAYER_ADDR: u16 = 79;
// RFC 7083
pub const OPTION_SOL_MAX_RT: u16 = 82;
pub const OPTION_INF_MAX_RT: u16 = 83;

// Status codes: RFC 8415, RFC 5007, RFC 5460
pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_UNSPEC_FAIL: u16 = 1;
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;
pub const STATUS_NO_BINDING: u16 = 3;
pub const STATUS_NOT_ON_LINK: u16 = 4;
pub const STATUS_USE_MULTICAST: u16 = 5;
pub const STATUS_NO_PREFIX_AVAIL: u16 = 6;
pub const STATUS_UNKNOWN_QUERY_TYPE: u16 = 7;
pub const STATUS_MALFORMED_QUERY: u16 = 8;
pub const STATUS_NOT_CONFIGURED: u16 = 9;
pub const STATUS_NOT_ALLOWED: u16 = 10;
pub const STATUS_QUERY_TERMINATED: u16 = 11;

/// A status code plus its human-readable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusCodeOption {
    pub status_code: u16,
    pub status_message: String,
}

impl StatusCodeOption {
    pub fn new(status_code: u16, status_message: impl Into<String>) -> Self {
        Self {
            status_code,
            status_message: status_message.into(),
        }
    }
}

/// RFC 8415 section 21.11.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationOption {
    pub protocol: u8,
    pub algorithm: u8,
    pub rdm: u8,
    pub replay_detection: u64,
    pub auth_info: Vec<u8>,
}

/// RFC 8415 section 21.16.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VendorClassOption {
    pub enterprise_number: u32,
    pub vendor_classes: Vec<Vec<u8>>,
}

/// RFC 8415 section 21.17. The vendor's own sub-option space is opaque.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VendorSpecificInformationOption {
    pub enterprise_number: u32,
    pub vendor_options: Vec<(u16, Vec<u8>)>,
}

/// RFC 4649.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdOption {
    pub enterprise_number: u32,
    pub remote_id: Vec<u8>,
}

impl RemoteIdOption {
    /// The `enterprise:hex` identity string the leasequery store indexes by.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.enterprise_number, hex::encode(&self.remote_id))
    }
}

/// RFC 6939.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkLayerIdOption {
    pub link_layer_type: u16,
    pub link_layer_address: Vec<u8>,
}

/// RFC 6603.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PdExcludeOption {
    pub prefix_length: u8,
    pub subnet_id: Vec<u8>,
}

/// RFC 4704: the name a client wants registered in DNS, plus the S/O/N
/// negotiation flags. The server never performs DNS updates itself; the
/// option is carried so clients and relays see consistent answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientFqdnOption {
    pub flags: u8,
    pub domain_name: DomainName,
}

impl ClientFqdnOption {
    /// S flag: the server should perform the AAAA update.
    pub fn server_aaaa_update(&self) -> bool {
        self.flags & 0x01 != 0
    }

    /// O flag: the server overrode the client's S preference.
    pub fn server_aaaa_override(&self) -> bool {
        self.flags & 0x02 != 0
    }

    /// N flag: the server should perform no DNS updates at all.
    pub fn no_server_dns_update(&self) -> bool {
        self.flags & 0x04 != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhcpOption {
    ClientId(Duid),
    ServerId(Duid),
    IaNa(IaNaOption),
    IaTa(IaTaOption),
    IaAddress(IaAddressOption),
    OptionRequest(Vec<u16>),
    Preference(u8),
    /// Time since the client started the transaction, in 1/100 s.
    ElapsedTime(u16),
    RelayMessage(Box<Message>),
    Authentication(AuthenticationOption),
    ServerUnicast(Ipv6Addr),
    StatusCode(StatusCodeOption),
    RapidCommit,
    UserClass(Vec<Vec<u8>>),
    VendorClass(VendorClassOption),
    VendorSpecificInformation(VendorSpecificInformationOption),
    InterfaceId(Vec<u8>),
    ReconfigureMessage(u8),
    ReconfigureAccept,
    SipServersDomainNameList(Vec<DomainName>),
    SipServersAddressList(Vec<Ipv6Addr>),
    RecursiveNameServers(Vec<Ipv6Addr>),
    DomainSearchList(Vec<DomainName>),
    IaPd(IaPdOption),
    IaPrefix(IaPrefixOption),
    SntpServers(Vec<Ipv6Addr>),
    InformationRefreshTime(u32),
    ClientFqdn(ClientFqdnOption),
    AftrName(DomainName),
    RemoteId(RemoteIdOption),
    SubscriberId(Vec<u8>),
    EchoRequest(Vec<u16>),
    LqQuery(LqQueryOption),
    ClientData(ClientDataOption),
    CltTime(u32),
    LqRelayData(LqRelayDataOption),
    LqClientLink(Vec<Ipv6Addr>),
    RelayId(Duid),
    NtpServer(Vec<NtpSubOption>),
    PdExclude(PdExcludeOption),
    LinkLayerId(LinkLayerIdOption),
    SolMaxRt(u32),
    InfMaxRt(u32),
    Unknown { option_type: u16, data: Vec<u8> },
}

impl DhcpOption {
    pub fn code(&self) -> u16 {
        match self {
            Self::ClientId(_) => OPTION_CLIENTID,
            Self::ServerId(_) => OPTION_SERVERID,
            Self::IaNa(_) => OPTION_IA_NA,
            Self::IaTa(_) => OPTION_IA_TA,
            Self::IaAddress(_) => OPTION_IAADDR,
            Self::OptionRequest(_) => OPTION_ORO,
            Self::Preference(_) => OPTION_PREFERENCE,
            Self::ElapsedTime(_) => OPTION_ELAPSED_TIME,
            Self::RelayMessage(_) => OPTION_RELAY_MSG,
            Self::Authentication(_) => OPTION_AUTH,
            Self::ServerUnicast(_) => OPTION_UNICAST,
            Self::StatusCode(_) => OPTION_STATUS_CODE,
            Self::RapidCommit => OPTION_RAPID_COMMIT,
            Self::UserClass(_) => OPTION_USER_CLASS,
            Self::VendorClass(_) => OPTION_VENDOR_CLASS,
            Self::VendorSpecificInformation(_) => OPTION_VENDOR_OPTS,
            Self::InterfaceId(_) => OPTION_INTERFACE_ID,
            Self::ReconfigureMessage(_) => OPTION_RECONF_MSG,
            Self::ReconfigureAccept => OPTION_RECONF_ACCEPT,
            Self::SipServersDomainNameList(_) => OPTION_SIP_SERVER_D,
            Self::SipServersAddressList(_) => OPTION_SIP_SERVER_A,
            Self::RecursiveNameServers(_) => OPTION_DNS_SERVERS,
            Self::DomainSearchList(_) => OPTION_DOMAIN_LIST,
            Self::IaPd(_) => OPTION_IA_PD,
            Self::IaPrefix(_) => OPTION_IAPREFIX,
            Self::SntpServers(_) => OPTION_SNTP_SERVERS,
            Self::InformationRefreshTime(_) => OPTION_INFORMATION_REFRESH_TIME,
            Self::ClientFqdn(_) => OPTION_CLIENT_FQDN,
            Self::AftrName(_) => OPTION_AFTR_NAME,
            Self::RemoteId(_) => OPTION_REMOTE_ID,
            Self::SubscriberId(_) => OPTION_SUBSCRIBER_ID,
            Self::EchoRequest(_) => OPTION_ERO,
            Self::LqQuery(_) => OPTION_LQ_QUERY,
            Self::ClientData(_) => OPTION_CLIENT_DATA,
            Self::CltTime(_) => OPTION_CLT_TIME,
            Self::LqRelayData(_) => OPTION_LQ_RELAY_DATA,
            Self::LqClientLink(_) => OPTION_LQ_CLIENT_LINK,
            Self::RelayId(_) => OPTION_RELAY_ID,
            Self::NtpServer(_) => OPTION_NTP_SERVER,
            Self::PdExclude(_) => OPTION_PD_EXCLUDE,
            Self::LinkLayerId(_) => OPTION_CLIENT_LINKLAYER_ADDR,
            Self::SolMaxRt(_) => OPTION_SOL_MAX_RT,
            Self::InfMaxRt(_) => OPTION_INF_MAX_RT,
            Self::Unknown { option_type, .. } => *option_type,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Unknown { .. } => "UnknownOption",
            _ => registry::options().name(self.code()).unwrap_or("UnknownOption"),
        }
    }

    /// Parse one option, framing included.
    ///
    /// The registry decides which decoder runs; unknown codes keep their raw
    /// payload. A declared length reaching past the buffer fails with
    /// `LengthOverflow`.
    pub fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        let code = bytes.be_u16()?;
        let len = bytes.be_u16()? as usize;
        let payload = bytes.slice(len)?;

        match registry::options().decoder(code) {
            Some(decode) => {
                let mut body = BytesIn::new(payload);
                let option = decode(&mut body)?;
                if !body.is_empty() {
                    return Err(Error::InvalidLength(
                        registry::options().name(code).unwrap_or("option"),
                    ));
                }

                Ok(option)
            }
            None => {
                trace!("Keeping option of unknown type {} as raw data", code);
                Ok(Self::Unknown {
                    option_type: code,
                    data: payload.to_vec(),
                })
            }
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        self.write_into(&mut BytesOut::new(buf))
    }

    pub fn write_into(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.be_u16(self.code());
        let len_pos = out.reserve_len();
        self.write_payload(out)?;
        out.patch_len(len_pos)
    }

    pub fn save(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }

    fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        match self {
            Self::ClientId(duid) | Self::ServerId(duid) | Self::RelayId(duid) => {
                duid.write(out.raw())
            }
            Self::IaNa(ia) => ia.write_payload(out),
            Self::IaTa(ia) => ia.write_payload(out),
            Self::IaAddress(addr) => addr.write_payload(out),
            Self::OptionRequest(codes) | Self::EchoRequest(codes) => {
                for code in codes {
                    out.be_u16(*code);
                }
                Ok(())
            }
            Self::Preference(preference) => {
                out.byte(*preference);
                Ok(())
            }
            Self::ElapsedTime(time) => {
                out.be_u16(*time);
                Ok(())
            }
            Self::RelayMessage(message) => message.write(out),
            Self::Authentication(auth) => {
                out.byte(auth.protocol)
                    .byte(auth.algorithm)
                    .byte(auth.rdm)
                    .push(&auth.replay_detection.to_be_bytes())
                    .push(&auth.auth_info);
                Ok(())
            }
            Self::ServerUnicast(address) => {
                out.push(&address.octets());
                Ok(())
            }
            Self::StatusCode(status) => {
                out.be_u16(status.status_code).push(status.status_message.as_bytes());
                Ok(())
            }
            Self::RapidCommit | Self::ReconfigureAccept => Ok(()),
            Self::UserClass(classes) => {
                for class in classes {
                    let len_pos = out.reserve_len();
                    out.push(class);
                    out.patch_len(len_pos)?;
                }
                Ok(())
            }
            Self::VendorClass(vendor) => {
                out.be_u32(vendor.enterprise_number);
                for class in &vendor.vendor_classes {
                    let len_pos = out.reserve_len();
                    out.push(class);
                    out.patch_len(len_pos)?;
                }
                Ok(())
            }
            Self::VendorSpecificInformation(vendor) => {
                out.be_u32(vendor.enterprise_number);
                for (code, data) in &vendor.vendor_options {
                    out.be_u16(*code);
                    let len_pos = out.reserve_len();
                    out.push(data);
                    out.patch_len(len_pos)?;
                }
                Ok(())
            }
            Self::InterfaceId(interface_id) => {
                out.push(interface_id);
                Ok(())
            }
            Self::ReconfigureMessage(message_type) => {
                out.byte(*message_type);
                Ok(())
            }
            Self::SipServersDomainNameList(names) | Self::DomainSearchList(names) => {
                for name in names {
                    name.write(out.raw())?;
                }
                Ok(())
            }
            Self::SipServersAddressList(addresses)
            | Self::RecursiveNameServers(addresses)
            | Self::SntpServers(addresses)
            | Self::LqClientLink(addresses) => {
                for address in addresses {
                    out.push(&address.octets());
                }
                Ok(())
            }
            Self::IaPd(ia) => ia.write_payload(out),
            Self::IaPrefix(prefix) => prefix.write_payload(out),
            Self::InformationRefreshTime(time) | Self::CltTime(time) => {
                out.be_u32(*time);
                Ok(())
            }
            Self::ClientFqdn(fqdn) => {
                out.byte(fqdn.flags);
                fqdn.domain_name.write(out.raw())
            }
            Self::AftrName(name) => name.write(out.raw()),
            Self::RemoteId(remote) => {
                out.be_u32(remote.enterprise_number).push(&remote.remote_id);
                Ok(())
            }
            Self::SubscriberId(subscriber_id) => {
                out.push(subscriber_id);
                Ok(())
            }
            Self::LqQuery(query) => query.write_payload(out),
            Self::ClientData(data) => data.write_payload(out),
            Self::LqRelayData(relay_data) => relay_data.write_payload(out),
            Self::NtpServer(suboptions) => {
                for suboption in suboptions {
                    suboption.write(out)?;
                }
                Ok(())
            }
            Self::PdExclude(exclude) => {
                out.byte(exclude.prefix_length).push(&exclude.subnet_id);
                Ok(())
            }
            Self::LinkLayerId(link_layer) => {
                out.be_u16(link_layer.link_layer_type).push(&link_layer.link_layer_address);
                Ok(())
            }
            Self::SolMaxRt(value) | Self::InfMaxRt(value) => {
                out.be_u32(*value);
                Ok(())
            }
            Self::Unknown { data, .. } => {
                out.push(data);
                Ok(())
            }
        }
    }

    /// Field-level checks plus, for containers, the containment grammar and
    /// a recursive descent into children.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::ClientId(duid) | Self::ServerId(duid) | Self::RelayId(duid) => duid.validate(),
            Self::ReconfigureMessage(message_type) => {
                // Only Renew (5) and Information-request (11) may be requested
                if *message_type != 5 && *message_type != 11 {
                    Err(Error::ReservedValue("ReconfigureMessageOption message type"))
                } else {
                    Ok(())
                }
            }
            Self::IaPrefix(prefix) => {
                prefix.validate_fields()?;
                self.validate_children()
            }
            Self::IaNa(_)
            | Self::IaTa(_)
            | Self::IaAddress(_)
            | Self::IaPd(_)
            | Self::RelayMessage(_)
            | Self::LqQuery(_)
            | Self::ClientData(_)
            | Self::LqRelayData(_)
            | Self::NtpServer(_) => self.validate_children(),
            _ => Ok(()),
        }
    }

    fn validate_children(&self) -> Result<(), Error> {
        crate::grammar::validate_option(self)?;

        for child in self.sub_options() {
            child.validate()?;
        }

        if let Self::RelayMessage(message) = self {
            message.validate()?;
        }
        if let Self::LqRelayData(relay_data) = self {
            relay_data.relay_message.validate()?;
        }

        Ok(())
    }

    /// The nested options of a container option, empty for leaf options.
    pub fn sub_options(&self) -> &[DhcpOption] {
        match self {
            Self::IaNa(ia) => &ia.options,
            Self::IaTa(ia) => &ia.options,
            Self::IaAddress(addr) => &addr.options,
            Self::IaPd(ia) => &ia.options,
            Self::IaPrefix(prefix) => &prefix.options,
            Self::LqQuery(query) => &query.options,
            Self::ClientData(data) => &data.options,
            _ => &[],
        }
    }
}

/// Parse options back to back until `bytes` is exhausted.
pub fn parse_options(bytes: &mut BytesIn<'_>) -> Result<Vec<DhcpOption>, Error> {
    let mut options = Vec::new();
    while !bytes.is_empty() {
        options.push(DhcpOption::parse(bytes)?);
    }

    Ok(options)
}

pub fn write_options(options: &[DhcpOption], out: &mut BytesOut<'_>) -> Result<(), Error> {
    for option in options {
        option.write_into(out)?;
    }

    Ok(())
}

/// First option with the given code, if any.
pub fn find_option(options: &[DhcpOption], code: u16) -> Option<&DhcpOption> {
    options.iter().find(|option| option.code() == code)
}

fn parse_address_list(bytes: &mut BytesIn<'_>, element: &'static str) -> Result<Vec<Ipv6Addr>, Error> {
    if bytes.remaining_len() % 16 != 0 {
        return Err(Error::InvalidLength(element));
    }

    let mut addresses = Vec::with_capacity(bytes.remaining_len() / 16);
    while !bytes.is_empty() {
        addresses.push(Ipv6Addr::from(bytes.arr::<16>()?));
    }

    Ok(addresses)
}

fn parse_code_list(bytes: &mut BytesIn<'_>, element: &'static str) -> Result<Vec<u16>, Error> {
    if bytes.remaining_len() % 2 != 0 {
        return Err(Error::InvalidLength(element));
    }

    let mut codes = Vec::with_capacity(bytes.remaining_len() / 2);
    while !bytes.is_empty() {
        codes.push(bytes.be_u16()?);
    }

    Ok(codes)
}

// Decoders registered with the option registry. Each one receives exactly
// the option payload and must consume all of it.

pub(crate) fn decode_client_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::ClientId(Duid::parse(b.remaining())?))
}

pub(crate) fn decode_server_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::ServerId(Duid::parse(b.remaining())?))
}

pub(crate) fn decode_ia_na(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::IaNa(IaNaOption::parse(b)?))
}

pub(crate) fn decode_ia_ta(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::IaTa(IaTaOption::parse(b)?))
}

pub(crate) fn decode_ia_address(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::IaAddress(IaAddressOption::parse(b)?))
}

pub(crate) fn decode_oro(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::OptionRequest(parse_code_list(b, "OptionRequestOption")?))
}

pub(crate) fn decode_preference(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let preference = b.byte()?;
    if !b.is_empty() {
        return Err(Error::InvalidLength("PreferenceOption"));
    }
    Ok(DhcpOption::Preference(preference))
}

pub(crate) fn decode_elapsed_time(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::ElapsedTime(b.be_u16()?))
}

pub(crate) fn decode_relay_message(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::RelayMessage(Box::new(Message::parse(b.remaining())?)))
}

pub(crate) fn decode_auth(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::Authentication(AuthenticationOption {
        protocol: b.byte()?,
        algorithm: b.byte()?,
        rdm: b.byte()?,
        replay_detection: u64::from_be_bytes(b.arr()?),
        auth_info: b.remaining().to_vec(),
    }))
}

pub(crate) fn decode_unicast(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::ServerUnicast(Ipv6Addr::from(b.arr::<16>()?)))
}

pub(crate) fn decode_status_code(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let status_code = b.be_u16()?;
    let status_message = String::from_utf8(b.remaining().to_vec())
        .map_err(|_| Error::InvalidLength("StatusCodeOption message"))?;

    Ok(DhcpOption::StatusCode(StatusCodeOption {
        status_code,
        status_message,
    }))
}

pub(crate) fn decode_rapid_commit(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    if !b.is_empty() {
        return Err(Error::InvalidLength("RapidCommitOption"));
    }
    Ok(DhcpOption::RapidCommit)
}

pub(crate) fn decode_user_class(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let mut classes = Vec::new();
    while !b.is_empty() {
        let len = b.be_u16()? as usize;
        classes.push(b.slice(len)?.to_vec());
    }
    Ok(DhcpOption::UserClass(classes))
}

pub(crate) fn decode_vendor_class(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let enterprise_number = b.be_u32()?;
    let mut vendor_classes = Vec::new();
    while !b.is_empty() {
        let len = b.be_u16()? as usize;
        vendor_classes.push(b.slice(len)?.to_vec());
    }
    Ok(DhcpOption::VendorClass(VendorClassOption {
        enterprise_number,
        vendor_classes,
    }))
}

pub(crate) fn decode_vendor_opts(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let enterprise_number = b.be_u32()?;
    let mut vendor_options = Vec::new();
    while !b.is_empty() {
        let code = b.be_u16()?;
        let len = b.be_u16()? as usize;
        vendor_options.push((code, b.slice(len)?.to_vec()));
    }
    Ok(DhcpOption::VendorSpecificInformation(VendorSpecificInformationOption {
        enterprise_number,
        vendor_options,
    }))
}

pub(crate) fn decode_interface_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::InterfaceId(b.remaining().to_vec()))
}

pub(crate) fn decode_reconf_msg(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let message_type = b.byte()?;
    if !b.is_empty() {
        return Err(Error::InvalidLength("ReconfigureMessageOption"));
    }
    Ok(DhcpOption::ReconfigureMessage(message_type))
}

pub(crate) fn decode_reconf_accept(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    if !b.is_empty() {
        return Err(Error::InvalidLength("ReconfigureAcceptOption"));
    }
    Ok(DhcpOption::ReconfigureAccept)
}

pub(crate) fn decode_sip_server_d(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::SipServersDomainNameList(DomainName::parse_list(b)?))
}

pub(crate) fn decode_sip_server_a(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::SipServersAddressList(parse_address_list(
        b,
        "SIPServersAddressListOption",
    )?))
}

pub(crate) fn decode_dns_servers(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::RecursiveNameServers(parse_address_list(
        b,
        "RecursiveNameServersOption",
    )?))
}

pub(crate) fn decode_domain_list(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::DomainSearchList(DomainName::parse_list(b)?))
}

pub(crate) fn decode_ia_pd(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::IaPd(IaPdOption::parse(b)?))
}

pub(crate) fn decode_ia_prefix(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::IaPrefix(IaPrefixOption::parse(b)?))
}

pub(crate) fn decode_sntp_servers(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::SntpServers(parse_address_list(b, "SNTPServersOption")?))
}

pub(crate) fn decode_information_refresh_time(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::InformationRefreshTime(b.be_u32()?))
}

pub(crate) fn decode_remote_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::RemoteId(RemoteIdOption {
        enterprise_number: b.be_u32()?,
        remote_id: b.remaining().to_vec(),
    }))
}

pub(crate) fn decode_subscriber_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::SubscriberId(b.remaining().to_vec()))
}

pub(crate) fn decode_echo_request(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::EchoRequest(parse_code_list(b, "EchoRequestOption")?))
}

pub(crate) fn decode_client_fqdn(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let flags = b.byte()?;
    let domain_name = DomainName::parse(b)?;
    if !b.is_empty() {
        return Err(Error::InvalidLength("ClientFQDNOption"));
    }

    Ok(DhcpOption::ClientFqdn(ClientFqdnOption { flags, domain_name }))
}

pub(crate) fn decode_aftr_name(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    let name = DomainName::parse(b)?;
    if !b.is_empty() {
        return Err(Error::InvalidLength("AFTRNameOption"));
    }

    Ok(DhcpOption::AftrName(name))
}

pub(crate) fn decode_lq_query(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::LqQuery(LqQueryOption::parse(b)?))
}

pub(crate) fn decode_client_data(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::ClientData(ClientDataOption::parse(b)?))
}

pub(crate) fn decode_clt_time(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::CltTime(b.be_u32()?))
}

pub(crate) fn decode_lq_relay_data(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::LqRelayData(LqRelayDataOption::parse(b)?))
}

pub(crate) fn decode_lq_client_link(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::LqClientLink(parse_address_list(
        b,
        "LQClientLinkOption",
    )?))
}

pub(crate) fn decode_relay_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::RelayId(Duid::parse(b.remaining())?))
}

pub(crate) fn decode_ntp_server(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::NtpServer(NtpSubOption::parse_list(b)?))
}

pub(crate) fn decode_pd_exclude(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::PdExclude(PdExcludeOption {
        prefix_length: b.byte()?,
        subnet_id: b.remaining().to_vec(),
    }))
}

pub(crate) fn decode_linklayer_id(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::LinkLayerId(LinkLayerIdOption {
        link_layer_type: b.be_u16()?,
        link_layer_address: b.remaining().to_vec(),
    }))
}

pub(crate) fn decode_sol_max_rt(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::SolMaxRt(b.be_u32()?))
}

pub(crate) fn decode_inf_max_rt(b: &mut BytesIn<'_>) -> Result<DhcpOption, Error> {
    Ok(DhcpOption::InfMaxRt(b.be_u32()?))
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(wire: &[u8]) -> DhcpOption {
        let mut bytes = BytesIn::new(wire);
        let option = DhcpOption::parse(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "trailing bytes after {:?}", option);
        assert_eq!(option.save().unwrap(), wire, "unstable round trip for {:?}", option);
        option
    }

    #[test]
    fn client_id() {
        let option = round_trip(&[
            0x00, 0x01, 0x00, 0x0a, 0x00, 0x03, 0x00, 0x01, 0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1,
        ]);
        match option {
            DhcpOption::ClientId(Duid::LinkLayer {
                hardware_type,
                link_layer_address,
            }) => {
                assert_eq!(hardware_type, 1);
                assert_eq!(link_layer_address, [0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1]);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn ia_na_with_address() {
        let option = round_trip(&[
            0x00, 0x03, 0x00, 0x28, // IA_NA, length 40
            0xc4, 0x3c, 0xb2, 0xf1, // iaid
            0x00, 0x00, 0x00, 0xbb, // t1
            0x00, 0x00, 0x01, 0x2c, // t2
            0x00, 0x05, 0x00, 0x18, // IAADDR, length 24
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x30, 0x01, //
            0x00, 0x00, 0x01, 0x77, // preferred 375
            0x00, 0x00, 0x02, 0x58, // valid 600
        ]);
        match &option {
            DhcpOption::IaNa(ia) => {
                assert_eq!(ia.iaid, 0xc43cb2f1);
                assert_eq!(ia.t1, 187);
                assert_eq!(ia.t2, 300);
                let addresses: Vec<_> = ia.addresses().collect();
                assert_eq!(addresses.len(), 1);
                assert_eq!(addresses[0].preferred_lifetime, 375);
                assert_eq!(addresses[0].valid_lifetime, 600);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn status_code() {
        let option = round_trip(&[
            0x00, 0x0d, 0x00, 0x08, 0x00, 0x05, b'o', b'o', b'p', b's', b'!', b'!',
        ]);
        match &option {
            DhcpOption::StatusCode(status) => {
                assert_eq!(status.status_code, STATUS_USE_MULTICAST);
                assert_eq!(status.status_message, "oops!!");
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn unknown_option_round_trips() {
        let option = round_trip(&[0x01, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc]);
        assert_eq!(
            option,
            DhcpOption::Unknown {
                option_type: 0x100,
                data: vec![0xaa, 0xbb, 0xcc],
            }
        );
        assert_eq!(option.class_name(), "UnknownOption");
    }

    #[test]
    fn declared_length_longer_than_buffer() {
        // length claims 4 bytes, only 3 present
        let wire = [0x00, 0x06, 0x00, 0x04, 0x00, 0x17, 0x00];
        let mut bytes = BytesIn::new(&wire);
        assert_eq!(DhcpOption::parse(&mut bytes), Err(Error::LengthOverflow));
    }

    #[test]
    fn address_list_must_be_multiple_of_16() {
        let mut wire = vec![0x00, 0x17, 0x00, 0x11];
        wire.extend_from_slice(&[0; 17]);
        let mut bytes = BytesIn::new(&wire);
        assert_eq!(
            DhcpOption::parse(&mut bytes),
            Err(Error::InvalidLength("RecursiveNameServersOption"))
        );
    }

    #[test]
    fn oro_codes() {
        let option = round_trip(&[0x00, 0x06, 0x00, 0x04, 0x00, 0x17, 0x00, 0x18]);
        assert_eq!(option, DhcpOption::OptionRequest(vec![0x17, 0x18]));
    }

    #[test]
    fn reconfigure_message_validation() {
        assert!(DhcpOption::ReconfigureMessage(5).validate().is_ok());
        assert!(DhcpOption::ReconfigureMessage(11).validate().is_ok());
        assert!(DhcpOption::ReconfigureMessage(7).validate().is_err());
    }

    #[test]
    fn vendor_class_round_trip() {
        let option = round_trip(&[
            0x00, 0x10, 0x00, 0x0b, // VENDOR_CLASS, length 11
            0x00, 0x00, 0x03, 0x68, // enterprise 872
            0x00, 0x03, b'f', b'o', b'o',
        ]);
        match &option {
            DhcpOption::VendorClass(vendor) => {
                assert_eq!(vendor.enterprise_number, 872);
                assert_eq!(vendor.vendor_classes, vec![b"foo".to_vec()]);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn client_fqdn_flags() {
        // 0x27 000e, flags 01, "steffann.nl"
        let mut wire = vec![0x00, 0x27, 0x00, 0x0e, 0x01];
        wire.extend_from_slice(b"\x08steffann\x02nl\x00");

        let option = round_trip(&wire);
        match &option {
            DhcpOption::ClientFqdn(fqdn) => {
                assert_eq!(fqdn.domain_name.to_string(), "steffann.nl");
                assert!(fqdn.server_aaaa_update());
                assert!(!fqdn.server_aaaa_override());
                assert!(!fqdn.no_server_dns_update());
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn aftr_name() {
        let mut wire = vec![0x00, 0x40, 0x00, 0x0e];
        wire.extend_from_slice(b"\x04aftr\x07example\x00");

        let option = round_trip(&wire);
        match &option {
            DhcpOption::AftrName(name) => assert_eq!(name.to_string(), "aftr.example"),
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn elapsed_time_units() {
        // 0x0bb8 = 3000 hundredths = 30 seconds
        let option = round_trip(&[0x00, 0x08, 0x00, 0x02, 0x0b, 0xb8]);
        assert_eq!(option, DhcpOption::ElapsedTime(3000));
    }
}
