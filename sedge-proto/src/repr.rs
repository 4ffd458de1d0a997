//! Renderings of protocol elements for humans and tooling.
//!
//! The machine form is JSON: every element renders as
//! `{"ClassName": {field: value, ...}}` with IPv6 addresses as canonical
//! strings and byte strings either as plain text (when fully printable) or
//! as `"hex:..."`. The `Display` impls reuse the same structure in indented
//! multi-line form, so nested relay chains stay readable in logs.

use core::fmt;

use serde_json::{json, Map, Value};

use crate::duid::Duid;
use crate::message::{ClientServerMessage, Message, RelayMessage, UnknownMessage};
use crate::options::{DhcpOption, NtpSubOption};

/// Printable bytes render as text, anything else as `hex:...`.
pub fn bytes_value(data: &[u8]) -> Value {
    if !data.is_empty() && data.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        Value::String(String::from_utf8_lossy(data).into_owned())
    } else {
        Value::String(format!("hex:{}", hex::encode(data)))
    }
}

fn class(name: &str, fields: Map<String, Value>) -> Value {
    let mut outer = Map::new();
    outer.insert(name.to_string(), Value::Object(fields));
    Value::Object(outer)
}

pub fn duid_value(duid: &Duid) -> Value {
    let mut fields = Map::new();
    match duid {
        Duid::LinkLayerTime {
            hardware_type,
            time,
            link_layer_address,
        } => {
            fields.insert("hardware_type".into(), json!(hardware_type));
            fields.insert("time".into(), json!(time));
            fields.insert(
                "link_layer_address".into(),
                Value::String(format!("hex:{}", hex::encode(link_layer_address))),
            );
        }
        Duid::Enterprise {
            enterprise_number,
            identifier,
        } => {
            fields.insert("enterprise_number".into(), json!(enterprise_number));
            fields.insert("identifier".into(), bytes_value(identifier));
        }
        Duid::LinkLayer {
            hardware_type,
            link_layer_address,
        } => {
            fields.insert("hardware_type".into(), json!(hardware_type));
            fields.insert(
                "link_layer_address".into(),
                Value::String(format!("hex:{}", hex::encode(link_layer_address))),
            );
        }
        Duid::Unknown { duid_type, data } => {
            fields.insert("duid_type".into(), json!(duid_type));
            fields.insert("data".into(), bytes_value(data));
        }
    }

    class(duid.class_name(), fields)
}

fn options_value(options: &[DhcpOption]) -> Value {
    Value::Array(options.iter().map(option_value).collect())
}

pub fn ntp_suboption_value(suboption: &NtpSubOption) -> Value {
    let mut fields = Map::new();
    match suboption {
        NtpSubOption::ServerAddress(address) | NtpSubOption::MulticastAddress(address) => {
            fields.insert("address".into(), json!(address.to_string()));
        }
        NtpSubOption::ServerFqdn(name) => {
            fields.insert("fqdn".into(), json!(name.to_string()));
        }
        NtpSubOption::Unknown {
            suboption_type,
            data,
        } => {
            fields.insert("suboption_type".into(), json!(suboption_type));
            fields.insert("data".into(), bytes_value(data));
        }
    }

    class(suboption.class_name(), fields)
}

pub fn option_value(option: &DhcpOption) -> Value {
    let mut fields = Map::new();

    match option {
        DhcpOption::ClientId(duid) | DhcpOption::ServerId(duid) | DhcpOption::RelayId(duid) => {
            fields.insert("duid".into(), duid_value(duid));
        }
        DhcpOption::IaNa(ia) => {
            fields.insert("iaid".into(), json!(format!("{:08x}", ia.iaid)));
            fields.insert("t1".into(), json!(ia.t1));
            fields.insert("t2".into(), json!(ia.t2));
            fields.insert("options".into(), options_value(&ia.options));
        }
        DhcpOption::IaTa(ia) => {
            fields.insert("iaid".into(), json!(format!("{:08x}", ia.iaid)));
            fields.insert("options".into(), options_value(&ia.options));
        }
        DhcpOption::IaAddress(addr) => {
            fields.insert("address".into(), json!(addr.address.to_string()));
            fields.insert("preferred_lifetime".into(), json!(addr.preferred_lifetime));
            fields.insert("valid_lifetime".into(), json!(addr.valid_lifetime));
            fields.insert("options".into(), options_value(&addr.options));
        }
        DhcpOption::OptionRequest(codes) | DhcpOption::EchoRequest(codes) => {
            fields.insert("requested_options".into(), json!(codes));
        }
        DhcpOption::Preference(preference) => {
            fields.insert("preference".into(), json!(preference));
        }
        DhcpOption::ElapsedTime(time) => {
            fields.insert("elapsed_time".into(), json!(time));
        }
        DhcpOption::RelayMessage(message) => {
            fields.insert("relayed_message".into(), message_value(message));
        }
        DhcpOption::Authentication(auth) => {
            fields.insert("protocol".into(), json!(auth.protocol));
            fields.insert("algorithm".into(), json!(auth.algorithm));
            fields.insert("rdm".into(), json!(auth.rdm));
            fields.insert("replay_detection".into(), json!(auth.replay_detection));
            fields.insert("auth_info".into(), bytes_value(&auth.auth_info));
        }
        DhcpOption::ServerUnicast(address) => {
            fields.insert("server_address".into(), json!(address.to_string()));
        }
        DhcpOption::StatusCode(status) => {
            fields.insert("status_code".into(), json!(status.status_code));
            fields.insert("status_message".into(), json!(status.status_message));
        }
        DhcpOption::RapidCommit | DhcpOption::ReconfigureAccept => {}
        DhcpOption::UserClass(classes) => {
            fields.insert(
                "user_classes".into(),
                Value::Array(classes.iter().map(|class| bytes_value(class)).collect()),
            );
        }
        DhcpOption::VendorClass(vendor) => {
            fields.insert("enterprise_number".into(), json!(vendor.enterprise_number));
            fields.insert(
                "vendor_classes".into(),
                Value::Array(vendor.vendor_classes.iter().map(|class| bytes_value(class)).collect()),
            );
        }
        DhcpOption::VendorSpecificInformation(vendor) => {
            fields.insert("enterprise_number".into(), json!(vendor.enterprise_number));
            let mut sub = Map::new();
            for (code, data) in &vendor.vendor_options {
                sub.insert(code.to_string(), bytes_value(data));
            }
            fields.insert("vendor_options".into(), Value::Object(sub));
        }
        DhcpOption::InterfaceId(interface_id) => {
            fields.insert("interface_id".into(), bytes_value(interface_id));
        }
        DhcpOption::ReconfigureMessage(message_type) => {
            fields.insert("message_type".into(), json!(message_type));
        }
        DhcpOption::SipServersDomainNameList(names) | DhcpOption::DomainSearchList(names) => {
            fields.insert(
                "domain_names".into(),
                Value::Array(names.iter().map(|name| json!(name.to_string())).collect()),
            );
        }
        DhcpOption::SipServersAddressList(addresses)
        | DhcpOption::RecursiveNameServers(addresses)
        | DhcpOption::SntpServers(addresses)
        | DhcpOption::LqClientLink(addresses) => {
            fields.insert(
                "addresses".into(),
                Value::Array(addresses.iter().map(|a| json!(a.to_string())).collect()),
            );
        }
        DhcpOption::IaPd(ia) => {
            fields.insert("iaid".into(), json!(format!("{:08x}", ia.iaid)));
            fields.insert("t1".into(), json!(ia.t1));
            fields.insert("t2".into(), json!(ia.t2));
            fields.insert("options".into(), options_value(&ia.options));
        }
        DhcpOption::IaPrefix(prefix) => {
            fields.insert(
                "prefix".into(),
                json!(format!("{}/{}", prefix.prefix, prefix.prefix_length)),
            );
            fields.insert("preferred_lifetime".into(), json!(prefix.preferred_lifetime));
            fields.insert("valid_lifetime".into(), json!(prefix.valid_lifetime));
            fields.insert("options".into(), options_value(&prefix.options));
        }
        DhcpOption::InformationRefreshTime(time) => {
            fields.insert("refresh_time".into(), json!(time));
        }
        DhcpOption::ClientFqdn(fqdn) => {
            fields.insert("flags".into(), json!(fqdn.flags));
            fields.insert("domain_name".into(), json!(fqdn.domain_name.to_string()));
        }
        DhcpOption::AftrName(name) => {
            fields.insert("fqdn".into(), json!(name.to_string()));
        }
        DhcpOption::RemoteId(remote) => {
            fields.insert("enterprise_number".into(), json!(remote.enterprise_number));
            fields.insert("remote_id".into(), bytes_value(&remote.remote_id));
        }
        DhcpOption::SubscriberId(subscriber_id) => {
            fields.insert("subscriber_id".into(), bytes_value(subscriber_id));
        }
        DhcpOption::LqQuery(query) => {
            fields.insert("query_type".into(), json!(query.query_type));
            fields.insert("link_address".into(), json!(query.link_address.to_string()));
            fields.insert("options".into(), options_value(&query.options));
        }
        DhcpOption::ClientData(data) => {
            fields.insert("options".into(), options_value(&data.options));
        }
        DhcpOption::CltTime(time) => {
            fields.insert("clt_time".into(), json!(time));
        }
        DhcpOption::LqRelayData(relay_data) => {
            fields.insert("peer_address".into(), json!(relay_data.peer_address.to_string()));
            fields.insert("relay_message".into(), message_value(&relay_data.relay_message));
        }
        DhcpOption::NtpServer(suboptions) => {
            fields.insert(
                "suboptions".into(),
                Value::Array(suboptions.iter().map(ntp_suboption_value).collect()),
            );
        }
        DhcpOption::PdExclude(exclude) => {
            fields.insert("prefix_length".into(), json!(exclude.prefix_length));
            fields.insert(
                "subnet_id".into(),
                Value::String(format!("hex:{}", hex::encode(&exclude.subnet_id))),
            );
        }
        DhcpOption::LinkLayerId(link_layer) => {
            fields.insert("link_layer_type".into(), json!(link_layer.link_layer_type));
            fields.insert(
                "link_layer_address".into(),
                Value::String(format!("hex:{}", hex::encode(&link_layer.link_layer_address))),
            );
        }
        DhcpOption::SolMaxRt(value) | DhcpOption::InfMaxRt(value) => {
            fields.insert("max_rt".into(), json!(value));
        }
        DhcpOption::Unknown { option_type, data } => {
            fields.insert("option_type".into(), json!(option_type));
            fields.insert("data".into(), bytes_value(data));
        }
    }

    class(option.class_name(), fields)
}

fn client_server_fields(message: &ClientServerMessage) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        "transaction_id".into(),
        Value::String(hex::encode(message.transaction_id)),
    );
    fields.insert("options".into(), options_value(&message.options));
    fields
}

fn relay_fields(message: &RelayMessage) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("hop_count".into(), json!(message.hop_count));
    fields.insert("link_address".into(), json!(message.link_address.to_string()));
    fields.insert("peer_address".into(), json!(message.peer_address.to_string()));
    fields.insert("options".into(), options_value(&message.options));
    fields
}

fn unknown_fields(message: &UnknownMessage) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("message_type".into(), json!(message.message_type));
    fields.insert("data".into(), bytes_value(&message.data));
    fields
}

pub fn message_value(message: &Message) -> Value {
    let fields = match message {
        Message::ClientServer(inner) => client_server_fields(inner),
        Message::Relay(inner) => relay_fields(inner),
        Message::Unknown(inner) => unknown_fields(inner),
    };

    class(message.class_name(), fields)
}

fn fmt_value(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match serde_json::to_string_pretty(value) {
        Ok(text) => f.write_str(&text),
        Err(_) => Err(fmt::Error),
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(&message_value(self), f)
    }
}

impl fmt::Display for ClientServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(
            &class(self.message_type.class_name(), client_server_fields(self)),
            f,
        )
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(&class(self.message_type.class_name(), relay_fields(self)), f)
    }
}

impl fmt::Display for DhcpOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(&option_value(self), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn byte_rendering() {
        assert_eq!(bytes_value(b"eth0"), Value::String("eth0".into()));
        assert_eq!(bytes_value(&[0x02, 0x00]), Value::String("hex:0200".into()));
        assert_eq!(bytes_value(&[]), Value::String("hex:".into()));
    }

    #[test]
    fn message_json_shape() {
        let mut message = ClientServerMessage::new(MessageType::Solicit, [0xf3, 0x50, 0xd6]);
        message.options.push(DhcpOption::ElapsedTime(0));
        let value = message_value(&Message::ClientServer(message));

        let root = value.as_object().unwrap();
        assert!(root.contains_key("SolicitMessage"));
        let fields = root["SolicitMessage"].as_object().unwrap();
        assert_eq!(fields["transaction_id"], json!("f350d6"));
        assert_eq!(
            fields["options"][0]["ElapsedTimeOption"]["elapsed_time"],
            json!(0)
        );
    }

    #[test]
    fn display_is_multiline_and_nested() {
        let mut relay = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 0,
            link_address: "2001:db8::1".parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: Vec::new(),
        };
        relay.set_relayed_message(Message::ClientServer(ClientServerMessage::new(
            MessageType::Solicit,
            [1, 2, 3],
        )));

        let rendered = Message::Relay(relay).to_string();
        assert!(rendered.contains("RelayForwardMessage"));
        assert!(rendered.contains("SolicitMessage"));
        assert!(rendered.lines().count() > 5);
    }
}
