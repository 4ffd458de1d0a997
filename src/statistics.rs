//! Shared statistics counters.
//!
//! One `Statistics` block is a set of `AtomicU64` counters; workers bump
//! them with relaxed increments and the exporter reads them without any
//! lock, so totals are approximate under load, which is fine for telemetry.
//! `ServerStatistics` keeps the global block plus optional per-interface,
//! per-subnet and per-relay blocks; for each request the dispatcher asks it
//! which blocks apply and the worker counts into all of them through a
//! `StatisticsSet`.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::Ipv6Net;
use serde_json::{json, Map, Value};

use sedge_proto::message::MessageType;
use sedge_proto::registry;

use crate::bundle::TransactionBundle;
use crate::config::StatisticsConfig;

#[derive(Default)]
pub struct Statistics {
    incoming_packets: AtomicU64,
    outgoing_packets: AtomicU64,

    unparsable_packets: AtomicU64,
    handling_errors: AtomicU64,

    for_other_server: AtomicU64,
    do_not_respond: AtomicU64,
    use_multicast: AtomicU64,
    unknown_query_type: AtomicU64,
    malformed_query: AtomicU64,
    not_allowed: AtomicU64,
    other_error: AtomicU64,

    messages_in: HashMap<u8, AtomicU64>,
    messages_out: HashMap<u8, AtomicU64>,
}

impl Statistics {
    pub fn new() -> Self {
        let mut messages_in = HashMap::new();
        let mut messages_out = HashMap::new();

        for code in registry::messages().codes() {
            let message_type = MessageType::from(code);
            if message_type.is_relay() {
                continue;
            }
            if message_type.from_client_to_server() {
                messages_in.insert(code, AtomicU64::new(0));
            }
            if message_type.from_server_to_client() {
                messages_out.insert(code, AtomicU64::new(0));
            }
        }

        Self {
            messages_in,
            messages_out,
            ..Default::default()
        }
    }

    pub fn count_incoming_packet(&self) {
        self.incoming_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_outgoing_packet(&self) {
        self.outgoing_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_unparsable_packet(&self) {
        self.unparsable_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_handling_error(&self) {
        self.handling_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_for_other_server(&self) {
        self.for_other_server.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_do_not_respond(&self) {
        self.do_not_respond.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_use_multicast(&self) {
        self.use_multicast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_unknown_query_type(&self) {
        self.unknown_query_type.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_malformed_query(&self) {
        self.malformed_query.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_not_allowed(&self) {
        self.not_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_other_error(&self) {
        self.other_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a received message type. Unknown types are not counted here;
    /// they show up in `unparsable_packets` or `do_not_respond` instead.
    pub fn count_message_in(&self, message_type: MessageType) {
        if let Some(counter) = self.messages_in.get(&u8::from(message_type)) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count_message_out(&self, message_type: MessageType) {
        if let Some(counter) = self.messages_out.get(&u8::from(message_type)) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn export(&self) -> Value {
        let mut out = Map::new();
        out.insert("incoming_packets".into(), json!(self.incoming_packets.load(Ordering::Relaxed)));
        out.insert("outgoing_packets".into(), json!(self.outgoing_packets.load(Ordering::Relaxed)));
        out.insert(
            "unparsable_packets".into(),
            json!(self.unparsable_packets.load(Ordering::Relaxed)),
        );
        out.insert("handling_errors".into(), json!(self.handling_errors.load(Ordering::Relaxed)));
        out.insert("for_other_server".into(), json!(self.for_other_server.load(Ordering::Relaxed)));
        out.insert("do_not_respond".into(), json!(self.do_not_respond.load(Ordering::Relaxed)));
        out.insert("use_multicast".into(), json!(self.use_multicast.load(Ordering::Relaxed)));
        out.insert(
            "unknown_query_type".into(),
            json!(self.unknown_query_type.load(Ordering::Relaxed)),
        );
        out.insert("malformed_query".into(), json!(self.malformed_query.load(Ordering::Relaxed)));
        out.insert("not_allowed".into(), json!(self.not_allowed.load(Ordering::Relaxed)));
        out.insert("other_error".into(), json!(self.other_error.load(Ordering::Relaxed)));

        out.insert("messages_in".into(), export_message_counters(&self.messages_in));
        out.insert("messages_out".into(), export_message_counters(&self.messages_out));

        Value::Object(out)
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Packets")?;
        writeln!(f, "- Incoming packets: {}", self.incoming_packets.load(Ordering::Relaxed))?;
        writeln!(f, "- Outgoing packets: {}", self.outgoing_packets.load(Ordering::Relaxed))?;
        writeln!(f, "Errors")?;
        writeln!(
            f,
            "- Unparsable packets: {}",
            self.unparsable_packets.load(Ordering::Relaxed)
        )?;
        writeln!(f, "- Handling errors: {}", self.handling_errors.load(Ordering::Relaxed))?;
        writeln!(f, "Special replies")?;
        writeln!(f, "- For other server: {}", self.for_other_server.load(Ordering::Relaxed))?;
        writeln!(f, "- Do not respond: {}", self.do_not_respond.load(Ordering::Relaxed))?;
        writeln!(f, "- Use multicast: {}", self.use_multicast.load(Ordering::Relaxed))?;
        writeln!(
            f,
            "- Unknown query type: {}",
            self.unknown_query_type.load(Ordering::Relaxed)
        )?;
        writeln!(f, "- Malformed query: {}", self.malformed_query.load(Ordering::Relaxed))?;
        writeln!(f, "- Not allowed: {}", self.not_allowed.load(Ordering::Relaxed))?;
        writeln!(f, "- Other error: {}", self.other_error.load(Ordering::Relaxed))?;

        writeln!(f, "Incoming messages")?;
        fmt_message_counters(f, &self.messages_in)?;
        writeln!(f, "Outgoing messages")?;
        fmt_message_counters(f, &self.messages_out)
    }
}

fn fmt_message_counters(
    f: &mut std::fmt::Formatter<'_>,
    counters: &HashMap<u8, AtomicU64>,
) -> std::fmt::Result {
    let mut codes: Vec<u8> = counters.keys().copied().collect();
    codes.sort_unstable();

    for code in codes {
        let name = registry::messages()
            .name(code)
            .map(|class_name| {
                class_name
                    .strip_suffix("Message")
                    .unwrap_or(class_name)
                    .to_string()
            })
            .unwrap_or_else(|| format!("Type {}", code));
        writeln!(f, "- {}: {}", name, counters[&code].load(Ordering::Relaxed))?;
    }

    Ok(())
}

fn export_message_counters(counters: &HashMap<u8, AtomicU64>) -> Value {
    let mut codes: Vec<u8> = counters.keys().copied().collect();
    codes.sort_unstable();

    let mut out = Map::new();
    for code in codes {
        let name = registry::messages()
            .name(code)
            .map(|class_name| registry::normalized_name(class_name, "Message").replace('-', "_"))
            .unwrap_or_else(|| format!("type_{}", code));
        out.insert(name, json!(counters[&code].load(Ordering::Relaxed)));
    }

    Value::Object(out)
}

/// The statistics blocks one request counts into.
#[derive(Clone, Default)]
pub struct StatisticsSet {
    set: Vec<Arc<Statistics>>,
}

macro_rules! delegate {
    ($($name:ident),*) => {
        $(
            pub fn $name(&self) {
                for stats in &self.set {
                    stats.$name();
                }
            }
        )*
    };
}

impl StatisticsSet {
    pub fn new(set: Vec<Arc<Statistics>>) -> Self {
        Self { set }
    }

    delegate!(
        count_incoming_packet,
        count_outgoing_packet,
        count_unparsable_packet,
        count_handling_error,
        count_for_other_server,
        count_do_not_respond,
        count_use_multicast,
        count_unknown_query_type,
        count_malformed_query,
        count_not_allowed,
        count_other_error
    );

    pub fn count_message_in(&self, message_type: MessageType) {
        for stats in &self.set {
            stats.count_message_in(message_type);
        }
    }

    pub fn count_message_out(&self, message_type: MessageType) {
        for stats in &self.set {
            stats.count_message_out(message_type);
        }
    }
}

/// Global counters plus the configured per-interface/subnet/relay breakdowns.
pub struct ServerStatistics {
    global: Arc<Statistics>,
    interfaces: HashMap<String, Arc<Statistics>>,
    subnets: HashMap<Ipv6Net, Arc<Statistics>>,
    relays: HashMap<Ipv6Addr, Arc<Statistics>>,
}

impl ServerStatistics {
    pub fn new(config: Option<&StatisticsConfig>) -> Self {
        let mut stats = Self {
            global: Arc::new(Statistics::new()),
            interfaces: HashMap::new(),
            subnets: HashMap::new(),
            relays: HashMap::new(),
        };
        if let Some(config) = config {
            stats.set_categories(config);
        }

        stats
    }

    /// Apply the configured category lists; existing counters for categories
    /// that stay configured keep their values across a reload.
    pub fn set_categories(&mut self, config: &StatisticsConfig) {
        update_categories(&mut self.interfaces, config.interfaces.iter().cloned());
        update_categories(&mut self.subnets, config.subnets.iter().copied());
        update_categories(&mut self.relays, config.relays.iter().copied());
    }

    /// All blocks a request on `interface_name` described by `bundle` counts
    /// into.
    pub fn update_set(
        &self,
        interface_name: Option<&str>,
        bundle: Option<&TransactionBundle>,
    ) -> StatisticsSet {
        let mut set = vec![self.global.clone()];

        if let Some(name) = interface_name {
            if let Some(stats) = self.interfaces.get(name) {
                set.push(stats.clone());
            }
        }

        if let Some(bundle) = bundle {
            let link_address = bundle.link_address();
            for (subnet, stats) in &self.subnets {
                if subnet.contains(&link_address) {
                    set.push(stats.clone());
                }
            }

            let relays = bundle.relays();
            for (address, stats) in &self.relays {
                if relays.contains(address) {
                    set.push(stats.clone());
                }
            }
        }

        StatisticsSet::new(set)
    }

    pub fn export(&self) -> Value {
        let mut out = Map::new();
        out.insert("global".into(), self.global.export());

        out.insert("interfaces".into(), export_category(&self.interfaces, |k| k.clone()));
        out.insert("subnets".into(), export_category(&self.subnets, |k| k.to_string()));
        out.insert("relays".into(), export_category(&self.relays, |k| k.to_string()));

        Value::Object(out)
    }
}

impl std::fmt::Display for ServerStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Global")?;
        write!(f, "{}", self.global)?;

        fn category<K>(
            f: &mut std::fmt::Formatter<'_>,
            label: &str,
            container: &HashMap<K, Arc<Statistics>>,
            key_name: impl Fn(&K) -> String,
        ) -> std::fmt::Result {
            let mut entries: Vec<(String, &Arc<Statistics>)> = container
                .iter()
                .map(|(key, stats)| (key_name(key), stats))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            for (name, stats) in entries {
                writeln!(f)?;
                writeln!(f, "{} {}", label, name)?;
                write!(f, "{}", stats)?;
            }

            Ok(())
        }

        category(f, "Interface", &self.interfaces, |k| k.clone())?;
        category(f, "Subnet", &self.subnets, |k| k.to_string())?;
        category(f, "Relay", &self.relays, |k| k.to_string())
    }
}

fn update_categories<K: std::hash::Hash + Eq>(
    container: &mut HashMap<K, Arc<Statistics>>,
    wanted: impl Iterator<Item = K>,
) {
    let mut keep = HashMap::new();
    for key in wanted {
        let stats = container
            .remove(&key)
            .unwrap_or_else(|| Arc::new(Statistics::new()));
        keep.insert(key, stats);
    }

    *container = keep;
}

fn export_category<K>(
    container: &HashMap<K, Arc<Statistics>>,
    key_name: impl Fn(&K) -> String,
) -> Value {
    let mut entries: Vec<(String, &Arc<Statistics>)> = container
        .iter()
        .map(|(key, stats)| (key_name(key), stats))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Map::new();
    for (name, stats) in entries {
        out.insert(name, stats.export());
    }

    Value::Object(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_counters_follow_direction() {
        let stats = Statistics::new();
        stats.count_message_in(MessageType::Solicit);
        stats.count_message_in(MessageType::Solicit);
        // Advertise is never received, so this increment is dropped
        stats.count_message_in(MessageType::Advertise);
        stats.count_message_out(MessageType::Advertise);

        let exported = stats.export();
        assert_eq!(exported["messages_in"]["solicit"], json!(2));
        assert!(exported["messages_in"].get("advertise").is_none());
        assert_eq!(exported["messages_out"]["advertise"], json!(1));
        assert_eq!(exported["messages_out"]["leasequery_reply"], json!(0));
    }

    #[test]
    fn set_counts_into_all_blocks() {
        let config = StatisticsConfig {
            interfaces: vec!["eth0".into()],
            subnets: vec![],
            relays: vec![],
        };
        let server_stats = ServerStatistics::new(Some(&config));

        server_stats.update_set(Some("eth0"), None).count_incoming_packet();
        server_stats.update_set(Some("eth1"), None).count_incoming_packet();

        let exported = server_stats.export();
        assert_eq!(exported["global"]["incoming_packets"], json!(2));
        assert_eq!(exported["interfaces"]["eth0"]["incoming_packets"], json!(1));
    }

    #[test]
    fn reload_keeps_surviving_categories() {
        let mut server_stats = ServerStatistics::new(Some(&StatisticsConfig {
            interfaces: vec!["eth0".into(), "eth1".into()],
            subnets: vec![],
            relays: vec![],
        }));
        server_stats.update_set(Some("eth0"), None).count_incoming_packet();

        server_stats.set_categories(&StatisticsConfig {
            interfaces: vec!["eth0".into()],
            subnets: vec![],
            relays: vec![],
        });

        let exported = server_stats.export();
        assert_eq!(exported["interfaces"]["eth0"]["incoming_packets"], json!(1));
        assert!(exported["interfaces"].get("eth1").is_none());
    }
}
