//! T1/T2 clamping for the IA options in a response.
//!
//! T1 and T2 default to a fraction of the shortest preferred lifetime in the
//! IA (0.5 and 0.8), then both are clamped into the configured bounds while
//! keeping `t1 <= t2 <= shortest preferred lifetime`.

use sedge_proto::options::DhcpOption;
use sedge_proto::INFINITY;

use crate::bundle::TransactionBundle;
use crate::config::TimingLimitsConfig;
use crate::handlers::{Handler, HandlerResult};

#[derive(Copy, Clone, PartialEq, Eq)]
enum IaKind {
    IaNa,
    IaPd,
}

pub struct TimingLimitsHandler {
    kind: IaKind,
    min_t1: u32,
    max_t1: u32,
    factor_t1: f64,
    min_t2: u32,
    max_t2: u32,
    factor_t2: f64,
}

impl TimingLimitsHandler {
    pub fn for_ia_na(config: &TimingLimitsConfig) -> Self {
        Self::new(IaKind::IaNa, config)
    }

    pub fn for_ia_pd(config: &TimingLimitsConfig) -> Self {
        Self::new(IaKind::IaPd, config)
    }

    fn new(kind: IaKind, config: &TimingLimitsConfig) -> Self {
        let max_t2 = config.max_t2.unwrap_or(INFINITY);
        // t1 may never reach past t2, nor t2 start below t1
        let max_t1 = config.max_t1.unwrap_or(INFINITY).min(max_t2);
        let min_t2 = config.min_t2.max(config.min_t1);

        Self {
            kind,
            min_t1: config.min_t1,
            max_t1,
            factor_t1: config.factor_t1.clamp(0.0, 1.0),
            min_t2,
            max_t2,
            factor_t2: config.factor_t2.clamp(0.0, 1.0),
        }
    }

    fn shortest_preferred(&self, options: &[DhcpOption]) -> Option<u32> {
        let lifetimes = options.iter().filter_map(|option| match (self.kind, option) {
            (IaKind::IaNa, DhcpOption::IaAddress(addr)) => Some(addr.preferred_lifetime),
            (IaKind::IaPd, DhcpOption::IaPrefix(prefix)) => Some(prefix.preferred_lifetime),
            _ => None,
        });

        lifetimes.min()
    }

    fn apply(&self, t1: &mut u32, t2: &mut u32, shortest_preferred: u32) {
        if *t1 == 0 {
            *t1 = if shortest_preferred == INFINITY {
                INFINITY
            } else {
                (shortest_preferred as f64 * self.factor_t1) as u32
            };
        }

        if *t2 == 0 {
            *t2 = if shortest_preferred == INFINITY {
                INFINITY
            } else {
                (shortest_preferred as f64 * self.factor_t2) as u32
            };
        }

        *t2 = (*t2).clamp(self.min_t2, self.max_t2).min(shortest_preferred);
        *t1 = (*t1).clamp(self.min_t1, self.max_t1).min(*t2);
    }
}

impl Handler for TimingLimitsHandler {
    fn name(&self) -> &'static str {
        match self.kind {
            IaKind::IaNa => "iana-timing-limits",
            IaKind::IaPd => "iapd-timing-limits",
        }
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(response) = bundle.response.as_mut() else {
            return Ok(());
        };

        for option in response.options.iter_mut() {
            let (t1t2, sub_options) = match (self.kind, option) {
                (IaKind::IaNa, DhcpOption::IaNa(ia)) => {
                    ((&mut ia.t1, &mut ia.t2), &ia.options)
                }
                (IaKind::IaPd, DhcpOption::IaPd(ia)) => {
                    ((&mut ia.t1, &mut ia.t2), &ia.options)
                }
                _ => continue,
            };

            // An IA without addresses or prefixes keeps its timers untouched
            let Some(shortest_preferred) = self.shortest_preferred(sub_options) else {
                continue;
            };

            let (t1, t2) = t1t2;
            self.apply(t1, t2, shortest_preferred);
        }

        Ok(())
    }
}
