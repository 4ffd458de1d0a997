//! Filters: conditions that scope handlers to subsets of clients.
//!
//! A filter holds a condition, nested filters and its own handlers. During
//! selection the tree is walked depth-first and matching branches contribute
//! their handlers before their parents', so the most specific configuration
//! wins by running first.

use log::debug;

use ipnet::Ipv6Net;

use crate::bundle::TransactionBundle;
use crate::config::{FilterConditionConfig, FilterConfig};
use crate::handlers::{build_handler, BuildContext, Handler};
use crate::ServerError;

pub enum FilterCondition {
    /// The bundle carries this mark.
    MarkedWith(String),
    /// The bundle's link-address lies in one of these prefixes.
    Subnet(Vec<Ipv6Net>),
    /// The client's elapsed time (seconds) is within these bounds.
    ElapsedTime {
        more_than: Option<u32>,
        less_than: Option<u32>,
    },
}

impl FilterCondition {
    pub fn matches(&self, bundle: &TransactionBundle) -> bool {
        match self {
            Self::MarkedWith(mark) => bundle.marks.contains(mark),

            Self::Subnet(prefixes) => {
                let link_address = bundle.link_address();
                prefixes.iter().any(|prefix| prefix.contains(&link_address))
            }

            Self::ElapsedTime {
                more_than,
                less_than,
            } => {
                // The option counts in 1/100 s, the configuration in seconds
                let Some(elapsed) = bundle
                    .request
                    .as_ref()
                    .and_then(|request| request.elapsed_time())
                else {
                    return false;
                };
                let elapsed = u32::from(elapsed);

                if let Some(more_than) = more_than {
                    if elapsed <= more_than.saturating_mul(100) {
                        return false;
                    }
                }
                if let Some(less_than) = less_than {
                    if elapsed >= less_than.saturating_mul(100) {
                        return false;
                    }
                }

                true
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::MarkedWith(mark) => format!("marked-with={}", mark),
            Self::Subnet(prefixes) => format!(
                "subnet={}",
                prefixes
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Self::ElapsedTime {
                more_than,
                less_than,
            } => format!("elapsed-time={:?}..{:?}", more_than, less_than),
        }
    }
}

pub struct Filter {
    pub condition: FilterCondition,
    pub sub_filters: Vec<Filter>,
    pub sub_handlers: Vec<Box<dyn Handler>>,
}

impl Filter {
    pub fn build(config: &FilterConfig, ctx: &mut BuildContext<'_>) -> Result<Self, ServerError> {
        let condition = match &config.condition {
            FilterConditionConfig::MarkedWith(mark) => {
                FilterCondition::MarkedWith(mark.trim().to_string())
            }
            FilterConditionConfig::Subnet(prefixes) => FilterCondition::Subnet(prefixes.clone()),
            FilterConditionConfig::ElapsedTime {
                more_than,
                less_than,
            } => FilterCondition::ElapsedTime {
                more_than: *more_than,
                less_than: *less_than,
            },
        };

        let mut sub_filters = Vec::new();
        for sub_config in &config.filters {
            sub_filters.push(Filter::build(sub_config, ctx)?);
        }

        let mut sub_handlers = Vec::new();
        for handler_config in &config.handlers {
            sub_handlers.push(build_handler(handler_config, ctx)?);
        }

        Ok(Self {
            condition,
            sub_filters,
            sub_handlers,
        })
    }

    pub fn worker_init(&mut self) -> Result<(), ServerError> {
        for filter in &mut self.sub_filters {
            filter.worker_init()?;
        }
        for handler in &mut self.sub_handlers {
            handler.worker_init()?;
        }

        Ok(())
    }

    /// Append references to the handlers this branch selects for `bundle`:
    /// nested matches first, own handlers after.
    pub fn collect(
        &self,
        bundle: &TransactionBundle,
        path: &mut Vec<usize>,
        out: &mut Vec<(Vec<usize>, usize)>,
    ) {
        if !self.condition.matches(bundle) {
            return;
        }

        debug!("Filter {} matched", self.condition.describe());

        for (index, filter) in self.sub_filters.iter().enumerate() {
            path.push(index);
            filter.collect(bundle, path, out);
            path.pop();
        }

        for index in 0..self.sub_handlers.len() {
            out.push((path.clone(), index));
        }
    }

    /// Navigate to the handler a `collect` entry points at.
    pub fn handler_at_mut(&mut self, path: &[usize], index: usize) -> &mut dyn Handler {
        let mut filter = self;
        for step in path {
            filter = &mut filter.sub_filters[*step];
        }

        filter.sub_handlers[index].as_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::message::{ClientServerMessage, Message, MessageType, RelayMessage};
    use sedge_proto::options::DhcpOption;

    fn bundle(elapsed: Option<u16>, link: &str) -> TransactionBundle {
        let mut request = ClientServerMessage::new(MessageType::Solicit, [1, 2, 3]);
        if let Some(elapsed) = elapsed {
            request.options.push(DhcpOption::ElapsedTime(elapsed));
        }

        let mut relay = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 0,
            link_address: link.parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: Vec::new(),
        };
        relay.set_relayed_message(Message::ClientServer(request));

        TransactionBundle::new(Message::Relay(relay), true, false)
    }

    #[test]
    fn subnet_condition() {
        let condition =
            FilterCondition::Subnet(vec!["2001:db8:ffff::/48".parse().unwrap()]);
        assert!(condition.matches(&bundle(None, "2001:db8:ffff:1::1")));
        assert!(!condition.matches(&bundle(None, "2001:db8:eeee::1")));
    }

    #[test]
    fn marked_with_condition() {
        let condition = FilterCondition::MarkedWith("gold".into());
        let mut b = bundle(None, "2001:db8:ffff:1::1");
        assert!(!condition.matches(&b));
        b.add_mark("gold");
        assert!(condition.matches(&b));
    }

    #[test]
    fn elapsed_time_condition() {
        // limits in seconds, option in 1/100 s
        let condition = FilterCondition::ElapsedTime {
            more_than: Some(10),
            less_than: Some(60),
        };

        assert!(!condition.matches(&bundle(None, "::1"))); // no option
        assert!(!condition.matches(&bundle(Some(1000), "::1"))); // exactly 10 s
        assert!(condition.matches(&bundle(Some(1050), "::1")));
        assert!(!condition.matches(&bundle(Some(6000), "::1"))); // 60 s
    }
}
