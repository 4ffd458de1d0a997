//! The configuration model.
//!
//! The configuration is a hierarchical JSON document. Parsing is plain
//! serde; everything interesting happens in the conversion helpers that turn
//! the document into protocol values (DUIDs, option codes) and in the
//! pipeline builder that turns the filter/handler tree into runtime objects.
//!
//! Address discovery is deliberately not done here: interface sections list
//! their addresses explicitly, and the automatic server DUID is derived from
//! a configured link-layer address. Enumeration of interfaces belongs to
//! deployment tooling, not to the server core.

use std::collections::HashSet;
use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv6Net;
use serde::Deserialize;

use sedge_proto::registry;
use sedge_proto::Duid;

use crate::ServerError;

/// The vendor magic prepended to a link-layer address when the server DUID
/// is auto-derived. Kept for compatibility with existing deployments; can be
/// overridden with `server.duid-prefix`.
pub const AUTO_DUID_PREFIX: [u8; 4] = [0x53, 0x4a, 0x4d, 0x53];

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerSection,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,

    /// Handlers that apply to every request.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,

    /// Filters scoping handlers to subsets of clients.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    pub listen_tcp: Option<ListenTcpConfig>,

    pub leasequery: Option<LeasequeryConfig>,

    pub statistics: Option<StatisticsConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServerSection {
    /// The server DUID as hex. When absent, one is derived from
    /// `link-layer-address` with the `duid-prefix` magic in front.
    pub duid: Option<String>,
    pub duid_prefix: Option<String>,
    pub link_layer_address: Option<String>,

    /// Worker thread count.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Width of the sliding handling-error window, in seconds.
    #[serde(default = "default_exception_window")]
    pub exception_window: f64,

    /// Handling errors within the window that trigger shutdown.
    #[serde(default = "default_max_exceptions")]
    pub max_exceptions: usize,

    #[serde(default)]
    pub allow_rapid_commit: bool,

    /// Rapid-commit even when the answer assigns nothing.
    #[serde(default)]
    pub rapid_commit_rejections: bool,
}

fn default_threads() -> usize {
    4
}

fn default_exception_window() -> f64 {
    1.0
}

fn default_max_exceptions() -> usize {
    10
}

impl ServerSection {
    /// The server DUID: configured hex, or the vendor magic plus the
    /// configured link-layer address.
    pub fn server_duid(&self) -> Result<Duid, ServerError> {
        if let Some(duid_hex) = &self.duid {
            let data = parse_hex(duid_hex)
                .ok_or_else(|| ServerError::config("server.duid is not valid hex"))?;
            if data.is_empty() {
                return Err(ServerError::config("server.duid may not be empty"));
            }
            return Duid::parse(&data).map_err(ServerError::from);
        }

        if let Some(address) = &self.link_layer_address {
            let address = parse_hex(address).ok_or_else(|| {
                ServerError::config("server.link-layer-address is not a valid hardware address")
            })?;

            let prefix = match &self.duid_prefix {
                Some(prefix_hex) => parse_hex(prefix_hex)
                    .ok_or_else(|| ServerError::config("server.duid-prefix is not valid hex"))?,
                None => AUTO_DUID_PREFIX.to_vec(),
            };

            let mut data = prefix;
            data.extend_from_slice(&address);
            return Duid::parse(&data).map_err(ServerError::from);
        }

        Err(ServerError::config(
            "no server DUID: set server.duid or server.link-layer-address",
        ))
    }
}

/// Addresses to listen on: explicit list only. `auto` and `all` require
/// interface enumeration, which lives outside the server core.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum AddressSelection {
    Keyword(AddressKeyword),
    List(Vec<Ipv6Addr>),
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressKeyword {
    Auto,
    All,
}

impl Default for AddressSelection {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl AddressSelection {
    pub fn resolve(&self, what: &str) -> Result<Vec<Ipv6Addr>, ServerError> {
        match self {
            Self::List(addresses) => Ok(addresses.clone()),
            Self::Keyword(_) => Err(ServerError::Config(format!(
                "{}: automatic address discovery is not available, list addresses explicitly",
                what
            ))),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct InterfaceConfig {
    pub name: String,

    #[serde(default)]
    pub multicast: bool,

    /// Accept multicast traffic sent by this host itself.
    #[serde(default)]
    pub listen_to_self: bool,

    #[serde(default)]
    pub link_local_addresses: AddressSelection,

    #[serde(default)]
    pub global_addresses: AddressSelection,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ListenTcpConfig {
    pub address: Ipv6Addr,

    /// Socket timeout for bulk leasequery connections, seconds.
    #[serde(default = "default_tcp_timeout")]
    pub timeout: u64,
}

fn default_tcp_timeout() -> u64 {
    30
}

/// An option code, by number or by registry name (`"recursive-name-servers"`).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum OptionCode {
    Code(u16),
    Name(String),
}

impl OptionCode {
    pub fn resolve(&self) -> Result<u16, ServerError> {
        match self {
            Self::Code(code) => Ok(*code),
            Self::Name(name) => registry::options()
                .code_by_name(name)
                .ok_or_else(|| ServerError::Config(format!("unknown option name: {}", name))),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LeasequeryConfig {
    /// Path of the SQLite lease database.
    pub store: PathBuf,

    /// Prefixes leasequery requestors may come from.
    #[serde(default)]
    pub allow_from: Vec<Ipv6Net>,

    /// Options never stored nor returned.
    #[serde(default)]
    pub sensitive_options: Vec<OptionCode>,
}

impl LeasequeryConfig {
    pub fn sensitive_option_codes(&self) -> Result<Vec<u16>, ServerError> {
        let mut codes = HashSet::new();
        for option in &self.sensitive_options {
            codes.insert(option.resolve()?);
        }

        let mut codes: Vec<u16> = codes.into_iter().collect();
        codes.sort_unstable();
        Ok(codes)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct StatisticsConfig {
    #[serde(default)]
    pub interfaces: Vec<String>,

    #[serde(default)]
    pub subnets: Vec<Ipv6Net>,

    #[serde(default)]
    pub relays: Vec<Ipv6Addr>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FilterConfig {
    pub condition: FilterConditionConfig,

    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum FilterConditionConfig {
    /// Matches bundles carrying the given mark.
    MarkedWith(String),

    /// Matches when the bundle's link-address falls in any of the prefixes.
    Subnet(Vec<Ipv6Net>),

    /// Matches on the client's elapsed-time option. Limits in seconds.
    ElapsedTime {
        #[serde(default)]
        more_than: Option<u32>,
        #[serde(default)]
        less_than: Option<u32>,
    },
}

/// One handler instance. The variant names double as the `option <name>`
/// sections of the original configuration format.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum HandlerConfig {
    /// Drop matching requests without an answer.
    Ignore,

    /// Attach a mark to matching bundles.
    Mark(String),

    /// Require multicast transport for matching clients.
    RequireMulticast,

    /// Allow unicast and advertise the given server address.
    ServerUnicast { address: Ipv6Addr },

    Preference {
        level: u8,
    },

    RecursiveNameServers {
        addresses: Vec<Ipv6Addr>,
        #[serde(default)]
        always_send: bool,
    },

    DomainSearchList {
        names: Vec<String>,
        #[serde(default)]
        always_send: bool,
    },

    SipServers {
        #[serde(default)]
        addresses: Vec<Ipv6Addr>,
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        always_send: bool,
    },

    SntpServers {
        addresses: Vec<Ipv6Addr>,
        #[serde(default)]
        always_send: bool,
    },

    NtpServers {
        #[serde(default)]
        addresses: Vec<Ipv6Addr>,
        #[serde(default)]
        multicast_addresses: Vec<Ipv6Addr>,
        #[serde(default)]
        fqdns: Vec<String>,
        #[serde(default)]
        always_send: bool,
    },

    /// DS-Lite AFTR tunnel endpoint name.
    AftrName {
        fqdn: String,
        #[serde(default)]
        always_send: bool,
    },

    SolMaxRt {
        seconds: u32,
        #[serde(default)]
        always_send: bool,
    },

    InfMaxRt {
        seconds: u32,
        #[serde(default)]
        always_send: bool,
    },

    InformationRefreshTime {
        seconds: u32,
        #[serde(default)]
        always_send: bool,
    },

    /// Clamp T1/T2 in IA_NA options.
    IanaTimingLimits(TimingLimitsConfig),

    /// Clamp T1/T2 in IA_PD options.
    IapdTimingLimits(TimingLimitsConfig),

    /// Static address/prefix assignments from a CSV file
    /// (columns: id, address, prefix).
    StaticCsv {
        file: PathBuf,
        #[serde(default = "default_address_preferred")]
        address_preferred_lifetime: u32,
        #[serde(default = "default_address_valid")]
        address_valid_lifetime: u32,
        #[serde(default = "default_prefix_preferred")]
        prefix_preferred_lifetime: u32,
        #[serde(default = "default_prefix_valid")]
        prefix_valid_lifetime: u32,
    },

    /// Static assignments from an SQLite database with an `assignments`
    /// table (columns: id, address, prefix). Unlike the CSV variant the
    /// database is consulted per request, so assignments can be updated
    /// without a reload.
    StaticSqlite {
        file: PathBuf,
        #[serde(default = "default_address_preferred")]
        address_preferred_lifetime: u32,
        #[serde(default = "default_address_valid")]
        address_valid_lifetime: u32,
        #[serde(default = "default_prefix_preferred")]
        prefix_preferred_lifetime: u32,
        #[serde(default = "default_prefix_valid")]
        prefix_valid_lifetime: u32,
    },

    /// Stop answering clients that send too many requests.
    RateLimit {
        #[serde(default = "default_rate_limit_key")]
        key: RateLimitKey,
        #[serde(default = "default_rate")]
        rate: u32,
        #[serde(default = "default_per")]
        per: u32,
        #[serde(default)]
        burst: Option<u32>,
    },
}

fn default_address_preferred() -> u32 {
    375
}

fn default_address_valid() -> u32 {
    600
}

fn default_prefix_preferred() -> u32 {
    375
}

fn default_prefix_valid() -> u32 {
    600
}

fn default_rate_limit_key() -> RateLimitKey {
    RateLimitKey::Duid
}

fn default_rate() -> u32 {
    5
}

fn default_per() -> u32 {
    30
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitKey {
    Duid,
    InterfaceId,
    RemoteId,
    SubscriberId,
    LinklayerId,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TimingLimitsConfig {
    #[serde(default)]
    pub min_t1: u32,
    pub max_t1: Option<u32>,
    #[serde(default = "default_factor_t1")]
    pub factor_t1: f64,
    #[serde(default)]
    pub min_t2: u32,
    pub max_t2: Option<u32>,
    #[serde(default = "default_factor_t2")]
    pub factor_t2: f64,
}

fn default_factor_t1() -> f64 {
    0.5
}

fn default_factor_t2() -> f64 {
    0.8
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.server.threads == 0 {
            return Err(ServerError::config("server.threads must be at least 1"));
        }

        // Fail early on unparsable DUID material
        let _ = self.server.server_duid()?;

        if let Some(leasequery) = &self.leasequery {
            let _ = leasequery.sensitive_option_codes()?;
        }

        for handler in self.all_handlers() {
            handler.validate()?;
        }

        Ok(())
    }

    /// Every handler config in document order, filters included.
    pub fn all_handlers(&self) -> Vec<&HandlerConfig> {
        fn walk<'c>(filters: &'c [FilterConfig], out: &mut Vec<&'c HandlerConfig>) {
            for filter in filters {
                walk(&filter.filters, out);
                out.extend(filter.handlers.iter());
            }
        }

        let mut out = Vec::new();
        walk(&self.filters, &mut out);
        out.extend(self.handlers.iter());
        out
    }
}

impl HandlerConfig {
    fn validate(&self) -> Result<(), ServerError> {
        match self {
            Self::IanaTimingLimits(limits) | Self::IapdTimingLimits(limits) => limits.validate(),
            Self::RateLimit { rate, per, .. } => {
                if *rate == 0 || *per == 0 {
                    Err(ServerError::config("rate-limit rate and per must be positive"))
                } else {
                    Ok(())
                }
            }
            Self::StaticCsv { file, .. } | Self::StaticSqlite { file, .. } => {
                if file.as_os_str().is_empty() {
                    Err(ServerError::config("static assignments need a file"))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

impl TimingLimitsConfig {
    fn validate(&self) -> Result<(), ServerError> {
        let max_t2 = self.max_t2.unwrap_or(sedge_proto::INFINITY);
        if self.min_t1 > max_t2 {
            return Err(ServerError::config("timing limits: min-t1 must not exceed max-t2"));
        }
        if self.factor_t1 > self.factor_t2 {
            return Err(ServerError::config(
                "timing limits: factor-t1 must not exceed factor-t2",
            ));
        }

        Ok(())
    }
}

/// Parse hex that may contain `:` or `-` separators (hardware addresses).
pub fn parse_hex(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| *c != ':' && *c != '-').collect();
    hex::decode(cleaned.trim()).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal(server: serde_json::Value) -> Config {
        serde_json::from_value(serde_json::json!({ "server": server })).unwrap()
    }

    #[test]
    fn explicit_duid() {
        let config = minimal(serde_json::json!({ "duid": "000300013431c43cb2f1" }));
        let duid = config.server.server_duid().unwrap();
        assert_eq!(duid.hex(), "000300013431c43cb2f1");
    }

    #[test]
    fn auto_duid_uses_vendor_prefix() {
        let config = minimal(serde_json::json!({ "link-layer-address": "00:24:fe:01:02:03" }));
        let duid = config.server.server_duid().unwrap();
        assert_eq!(duid.hex(), "534a4d530024fe010203");
    }

    #[test]
    fn auto_duid_prefix_is_configurable() {
        let config = minimal(serde_json::json!({
            "link-layer-address": "0024fe010203",
            "duid-prefix": "deadbeef"
        }));
        assert_eq!(config.server.server_duid().unwrap().hex(), "deadbeef0024fe010203");
    }

    #[test]
    fn missing_duid_material_fails() {
        let config = minimal(serde_json::json!({}));
        assert!(config.server.server_duid().is_err());
    }

    #[test]
    fn full_document_parses() {
        let document = serde_json::json!({
            "server": {
                "duid": "000300013431c43cb2f1",
                "threads": 2,
                "allow-rapid-commit": true
            },
            "interfaces": [{
                "name": "eth0",
                "multicast": true,
                "link-local-addresses": ["fe80::1"],
                "global-addresses": ["2001:db8::1"]
            }],
            "handlers": [
                { "recursive-name-servers": { "addresses": ["2001:4860:4860::8888"] } },
                { "iana-timing-limits": { "min-t1": 300, "max-t2": 7200 } }
            ],
            "filters": [{
                "condition": { "subnet": ["2001:db8:ffff::/48"] },
                "handlers": [
                    { "static-csv": { "file": "/var/lib/sedge/assignments.csv" } },
                    { "mark": "gold" }
                ]
            }],
            "listen-tcp": { "address": "2001:db8::1" },
            "leasequery": {
                "store": "/var/lib/sedge/leases.sqlite",
                "allow-from": ["2001:db8:beef::/48"],
                "sensitive-options": ["user-class", 17]
            },
            "statistics": {
                "subnets": ["2001:db8:ffff::/48"]
            }
        });

        let config: Config = serde_json::from_value(document).unwrap();
        config.validate().unwrap();

        assert_eq!(config.all_handlers().len(), 4);
        let codes = config.leasequery.as_ref().unwrap().sensitive_option_codes().unwrap();
        assert_eq!(codes, vec![15, 17]);
    }

    #[test]
    fn bad_timing_limits_rejected() {
        let document = serde_json::json!({
            "server": { "duid": "000300013431c43cb2aa" },
            "handlers": [
                { "iana-timing-limits": { "min-t1": 100, "max-t2": 50 } }
            ]
        });
        let config: Config = serde_json::from_value(document).unwrap();
        assert!(config.validate().is_err());
    }
}
