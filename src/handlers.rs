//! The handler abstraction and the construction of handlers from
//! configuration.
//!
//! A handler sees every bundle in three ordered phases: `pre` (validate,
//! possibly short-circuit), `handle` (build the response), `post` (fix-ups
//! with the full response in view). The `analyse_pre`/`analyse_post` hooks
//! run outside the short-circuit path and must tolerate a missing or partial
//! response; the leasequery store observes replies from `analyse_post`.
//!
//! Short-circuiting happens through [`HandlerError`]: the first one raised
//! wins and the dispatcher in [`crate::pipeline`] translates it into a
//! counter bump and, for the reply-with-status family, a minimal reply.

use std::str::FromStr;

use thiserror::Error;

use sedge_proto::options::{
    StatusCodeOption, STATUS_MALFORMED_QUERY, STATUS_NOT_ALLOWED, STATUS_UNKNOWN_QUERY_TYPE,
};
use sedge_proto::{DhcpOption, DomainName};

use crate::bundle::TransactionBundle;
use crate::config::HandlerConfig;
use crate::ServerError;

pub mod basic;
pub mod rate_limit;
pub mod relay;
pub mod standard;
pub mod static_assign;
pub mod timing;

/// A short-circuit condition raised by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Drop the request without an answer.
    #[error("cannot respond: {0}")]
    CannotRespond(String),

    /// The specific no-answer case of a server-id mismatch.
    #[error("message is for another server: {0}")]
    ForOtherServer(String),

    /// The client unicasted where multicast is required.
    #[error("client must use multicast: {0}")]
    UseMulticast(String),

    /// Answer with a minimal reply carrying only a status code.
    #[error("replying with status {}: {}", status.status_code, status.status_message)]
    ReplyWithStatus {
        status: StatusCodeOption,
        /// Build a leasequery-reply instead of a plain reply.
        leasequery: bool,
    },
}

impl HandlerError {
    pub fn cannot_respond(message: impl Into<String>) -> Self {
        Self::CannotRespond(message.into())
    }

    pub fn reply_with_status(code: u16, message: impl Into<String>) -> Self {
        Self::ReplyWithStatus {
            status: StatusCodeOption::new(code, message),
            leasequery: false,
        }
    }

    pub fn reply_with_leasequery(code: u16, message: impl Into<String>) -> Self {
        Self::ReplyWithStatus {
            status: StatusCodeOption::new(code, message),
            leasequery: true,
        }
    }

    /// Which counter this condition belongs to.
    pub fn counter(&self) -> Counter {
        match self {
            Self::CannotRespond(_) => Counter::DoNotRespond,
            Self::ForOtherServer(_) => Counter::ForOtherServer,
            Self::UseMulticast(_) => Counter::UseMulticast,
            Self::ReplyWithStatus { status, .. } => match status.status_code {
                STATUS_UNKNOWN_QUERY_TYPE => Counter::UnknownQueryType,
                STATUS_MALFORMED_QUERY => Counter::MalformedQuery,
                STATUS_NOT_ALLOWED => Counter::NotAllowed,
                _ => Counter::OtherError,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Counter {
    DoNotRespond,
    ForOtherServer,
    UseMulticast,
    UnknownQueryType,
    MalformedQuery,
    NotAllowed,
    OtherError,
}

pub type HandlerResult = Result<(), HandlerError>;

pub trait Handler: Send {
    /// A short name for log lines.
    fn name(&self) -> &'static str;

    /// Called once per worker after the pipeline was built there. Resources
    /// that cannot be shared between workers (database connections) are
    /// opened here, never during construction.
    fn worker_init(&mut self) -> Result<(), ServerError> {
        Ok(())
    }

    /// Observation hook before handling. Must not fail the request.
    fn analyse_pre(&mut self, _bundle: &mut TransactionBundle) {}

    fn pre(&mut self, _bundle: &mut TransactionBundle) -> HandlerResult {
        Ok(())
    }

    fn handle(&mut self, _bundle: &mut TransactionBundle) -> HandlerResult {
        Ok(())
    }

    fn post(&mut self, _bundle: &mut TransactionBundle) -> HandlerResult {
        Ok(())
    }

    /// Observation hook after handling. Runs even when the request was
    /// short-circuited, with whatever response (possibly none) remains.
    fn analyse_post(&mut self, _bundle: &mut TransactionBundle) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Shared pieces handlers may need while being built from configuration.
pub struct BuildContext<'a> {
    pub rate_limiters: &'a [std::sync::Arc<rate_limit::RateLimitCounters>],
    pub next_rate_limiter: usize,
}

/// Turn one handler config entry into a runtime handler.
pub fn build_handler(
    config: &HandlerConfig,
    ctx: &mut BuildContext<'_>,
) -> Result<Box<dyn Handler>, ServerError> {
    use self::basic::SimpleOptionHandler;

    let handler: Box<dyn Handler> = match config {
        HandlerConfig::Ignore => Box::new(basic::IgnoreRequestHandler),

        HandlerConfig::Mark(mark) => Box::new(basic::MarkHandler::new(mark)),

        HandlerConfig::RequireMulticast => Box::new(standard::RequireMulticastHandler),

        HandlerConfig::ServerUnicast { address } => {
            Box::new(standard::ServerUnicastOptionHandler::new(*address))
        }

        HandlerConfig::Preference { level } => Box::new(SimpleOptionHandler::new(
            "preference",
            DhcpOption::Preference(*level),
            true,
        )),

        HandlerConfig::RecursiveNameServers {
            addresses,
            always_send,
        } => Box::new(SimpleOptionHandler::new(
            "recursive-name-servers",
            DhcpOption::RecursiveNameServers(addresses.clone()),
            *always_send,
        )),

        HandlerConfig::DomainSearchList { names, always_send } => {
            Box::new(SimpleOptionHandler::new(
                "domain-search-list",
                DhcpOption::DomainSearchList(parse_names(names)?),
                *always_send,
            ))
        }

        HandlerConfig::SipServers {
            addresses,
            names,
            always_send,
        } => {
            // One config section, up to two wire options
            if !names.is_empty() && !addresses.is_empty() {
                Box::new(basic::MultiOptionHandler::new(
                    "sip-servers",
                    vec![
                        DhcpOption::SipServersDomainNameList(parse_names(names)?),
                        DhcpOption::SipServersAddressList(addresses.clone()),
                    ],
                    *always_send,
                ))
            } else if !names.is_empty() {
                Box::new(SimpleOptionHandler::new(
                    "sip-servers",
                    DhcpOption::SipServersDomainNameList(parse_names(names)?),
                    *always_send,
                ))
            } else {
                Box::new(SimpleOptionHandler::new(
                    "sip-servers",
                    DhcpOption::SipServersAddressList(addresses.clone()),
                    *always_send,
                ))
            }
        }

        HandlerConfig::SntpServers {
            addresses,
            always_send,
        } => Box::new(SimpleOptionHandler::new(
            "sntp-servers",
            DhcpOption::SntpServers(addresses.clone()),
            *always_send,
        )),

        HandlerConfig::NtpServers {
            addresses,
            multicast_addresses,
            fqdns,
            always_send,
        } => {
            use sedge_proto::options::NtpSubOption;

            let mut suboptions = Vec::new();
            for address in addresses {
                suboptions.push(NtpSubOption::ServerAddress(*address));
            }
            for address in multicast_addresses {
                suboptions.push(NtpSubOption::MulticastAddress(*address));
            }
            for fqdn in fqdns {
                suboptions.push(NtpSubOption::ServerFqdn(parse_name(fqdn)?));
            }
            if suboptions.is_empty() {
                return Err(ServerError::config("ntp-servers: no servers configured"));
            }

            Box::new(SimpleOptionHandler::new(
                "ntp-servers",
                DhcpOption::NtpServer(suboptions),
                *always_send,
            ))
        }

        HandlerConfig::AftrName { fqdn, always_send } => Box::new(SimpleOptionHandler::new(
            "aftr-name",
            DhcpOption::AftrName(parse_name(fqdn)?),
            *always_send,
        )),

        HandlerConfig::SolMaxRt {
            seconds,
            always_send,
        } => Box::new(SimpleOptionHandler::new(
            "sol-max-rt",
            DhcpOption::SolMaxRt(*seconds),
            *always_send,
        )),

        HandlerConfig::InfMaxRt {
            seconds,
            always_send,
        } => Box::new(SimpleOptionHandler::new(
            "inf-max-rt",
            DhcpOption::InfMaxRt(*seconds),
            *always_send,
        )),

        HandlerConfig::InformationRefreshTime {
            seconds,
            always_send,
        } => Box::new(SimpleOptionHandler::new(
            "information-refresh-time",
            DhcpOption::InformationRefreshTime(*seconds),
            *always_send,
        )),

        HandlerConfig::IanaTimingLimits(limits) => {
            Box::new(timing::TimingLimitsHandler::for_ia_na(limits))
        }

        HandlerConfig::IapdTimingLimits(limits) => {
            Box::new(timing::TimingLimitsHandler::for_ia_pd(limits))
        }

        HandlerConfig::StaticCsv {
            file,
            address_preferred_lifetime,
            address_valid_lifetime,
            prefix_preferred_lifetime,
            prefix_valid_lifetime,
        } => Box::new(static_assign::CsvStaticAssignmentHandler::new(
            file,
            static_assign::Lifetimes {
                address_preferred: *address_preferred_lifetime,
                address_valid: *address_valid_lifetime,
                prefix_preferred: *prefix_preferred_lifetime,
                prefix_valid: *prefix_valid_lifetime,
            },
        )?),

        HandlerConfig::StaticSqlite {
            file,
            address_preferred_lifetime,
            address_valid_lifetime,
            prefix_preferred_lifetime,
            prefix_valid_lifetime,
        } => Box::new(static_assign::SqliteStaticAssignmentHandler::new(
            file,
            static_assign::Lifetimes {
                address_preferred: *address_preferred_lifetime,
                address_valid: *address_valid_lifetime,
                prefix_preferred: *prefix_preferred_lifetime,
                prefix_valid: *prefix_valid_lifetime,
            },
        )),

        HandlerConfig::RateLimit { key, .. } => {
            let counters = ctx
                .rate_limiters
                .get(ctx.next_rate_limiter)
                .cloned()
                .ok_or_else(|| ServerError::config("rate limiter state out of sync"))?;
            ctx.next_rate_limiter += 1;

            Box::new(rate_limit::RateLimitHandler::new(*key, counters))
        }
    };

    Ok(handler)
}

fn parse_name(name: &str) -> Result<DomainName, ServerError> {
    DomainName::from_str(name)
        .map_err(|e| ServerError::Config(format!("invalid domain name '{}': {}", name, e)))
}

fn parse_names(names: &[String]) -> Result<Vec<DomainName>, ServerError> {
    names.iter().map(|name| parse_name(name)).collect()
}
