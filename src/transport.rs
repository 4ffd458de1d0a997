//! Sockets and the wire-side packet handling around the pipeline.
//!
//! Each interface gets its listening sockets built from configuration:
//! global addresses, link-local addresses, and optionally the
//! All_DHCP_Relay_Agents_and_Servers multicast group. A multicast listener
//! cannot answer from the multicast address, so it is paired with the
//! interface's first link-local socket for replies; a unicast listener
//! always replies from itself.
//!
//! Every accepted datagram is wrapped in one synthetic relay-forward hop
//! before parsing results reach the pipeline: link-address = the
//! interface's global address (so subnet selection works for directly
//! connected clients), peer-address = the packet source, plus an
//! interface-id option naming the interface. Replies strip that hop again
//! and use its peer-address as the destination.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, TcpListener, UdpSocket};
use std::sync::Arc;

use log::{debug, warn};

use socket2::{Domain, Protocol, Socket, Type};

use sedge_proto::message::{Message, MessageType, RelayMessage};
use sedge_proto::options::DhcpOption;
use sedge_proto::{ALL_DHCP_RELAY_AGENTS_AND_SERVERS, CLIENT_PORT, SERVER_PORT};

use crate::bundle::{is_link_local, TransactionBundle};
use crate::config::{InterfaceConfig, ListenTcpConfig};
use crate::ServerError;

/// A listening socket and the socket its replies leave through.
pub struct ListeningSocket {
    pub interface: String,
    pub interface_index: u32,
    pub listen_address: Ipv6Addr,
    /// The interface's global address, used as the synthetic hop's
    /// link-address. Unspecified when the interface has none.
    pub global_address: Ipv6Addr,
    pub socket: UdpSocket,
    /// Reply socket when it differs from the listening one (multicast).
    pub reply_socket: Option<Arc<UdpSocket>>,
}

impl ListeningSocket {
    pub fn is_multicast(&self) -> bool {
        self.listen_address.is_multicast()
    }

    pub fn reply_socket(&self) -> &UdpSocket {
        match &self.reply_socket {
            Some(socket) => socket,
            None => &self.socket,
        }
    }
}

fn interface_index(name: &str) -> Result<u32, ServerError> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| ServerError::Config(format!("invalid interface name: {}", name)))?;

    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(ServerError::Config(format!("unknown interface: {}", name)));
    }

    Ok(index)
}

fn bind_udp(address: SocketAddrV6, reuse: bool) -> Result<UdpSocket, ServerError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&SocketAddr::V6(address).into())?;

    Ok(socket.into())
}

/// Build the listening sockets for one interface.
pub fn interface_sockets(config: &InterfaceConfig) -> Result<Vec<ListeningSocket>, ServerError> {
    let index = interface_index(&config.name)?;

    let global_addresses = config
        .global_addresses
        .resolve(&format!("interface {} global-addresses", config.name))?;
    let link_local_addresses = config
        .link_local_addresses
        .resolve(&format!("interface {} link-local-addresses", config.name))?;

    let primary_global = global_addresses.first().copied().unwrap_or(Ipv6Addr::UNSPECIFIED);

    let mut sockets = Vec::new();

    for address in &global_addresses {
        debug!("Creating socket for {} on {}", address, config.name);
        let socket = bind_udp(SocketAddrV6::new(*address, SERVER_PORT, 0, 0), false)?;
        sockets.push(ListeningSocket {
            interface: config.name.clone(),
            interface_index: index,
            listen_address: *address,
            global_address: primary_global,
            socket,
            reply_socket: None,
        });
    }

    let mut link_local_reply: Option<Arc<UdpSocket>> = None;
    for address in &link_local_addresses {
        debug!("Creating socket for {} on {}", address, config.name);
        let socket = bind_udp(SocketAddrV6::new(*address, SERVER_PORT, 0, index), false)?;
        let socket = Arc::new(socket);
        if link_local_reply.is_none() {
            link_local_reply = Some(socket.clone());
        }

        sockets.push(ListeningSocket {
            interface: config.name.clone(),
            interface_index: index,
            listen_address: *address,
            global_address: primary_global,
            socket: socket
                .try_clone()
                .map_err(ServerError::from)?,
            reply_socket: None,
        });
    }

    if config.multicast {
        let reply_socket = link_local_reply.ok_or_else(|| {
            ServerError::Config(format!(
                "interface {}: multicast listening requires a link-local reply address",
                config.name
            ))
        })?;

        debug!(
            "Creating multicast socket for {} on {}",
            ALL_DHCP_RELAY_AGENTS_AND_SERVERS, config.name
        );

        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(
            &SocketAddr::V6(SocketAddrV6::new(
                ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
                SERVER_PORT,
                0,
                index,
            ))
            .into(),
        )?;
        socket.join_multicast_v6(&ALL_DHCP_RELAY_AGENTS_AND_SERVERS, index)?;
        socket.set_multicast_loop_v6(config.listen_to_self)?;

        sockets.push(ListeningSocket {
            interface: config.name.clone(),
            interface_index: index,
            listen_address: ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
            global_address: primary_global,
            socket: socket.into(),
            reply_socket: Some(reply_socket),
        });
    }

    Ok(sockets)
}

pub fn tcp_listener(config: &ListenTcpConfig) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V6(SocketAddrV6::new(config.address, SERVER_PORT, 0, 0)).into())?;
    socket.listen(8)?;

    Ok(socket.into())
}

/// Wrap a received message in the synthetic outer relay hop.
pub fn wrap_incoming(
    message: Message,
    interface: &str,
    link_address: Ipv6Addr,
    source: Ipv6Addr,
) -> Message {
    let hop_count = match &message {
        Message::Relay(relay) => relay.hop_count.saturating_add(1),
        _ => 0,
    };

    let mut outer = RelayMessage {
        message_type: MessageType::RelayForward,
        hop_count,
        link_address,
        peer_address: source,
        options: vec![DhcpOption::InterfaceId(interface.as_bytes().to_vec())],
    };
    outer.set_relayed_message(message);

    Message::Relay(outer)
}

/// Where and what to send for a handled bundle: destination address/port and
/// the unwrapped reply, with the synthetic hop removed.
pub fn outgoing_datagram(
    bundle: &mut TransactionBundle,
    interface_index: u32,
) -> Option<(SocketAddrV6, Vec<u8>)> {
    let outgoing = bundle.outgoing_message()?;

    // the outermost hop is the synthetic one
    let Message::Relay(outer) = outgoing else {
        warn!("Outgoing message lost its relay wrapping");
        return None;
    };

    let inner = outer.relayed_message()?;

    // replies to relays go to the server port, replies to clients to the
    // client port
    let port = if matches!(inner, Message::Relay(_)) {
        SERVER_PORT
    } else {
        CLIENT_PORT
    };

    let destination = outer.peer_address;
    let scope = if is_link_local(&destination) {
        interface_index
    } else {
        0
    };

    let data = match inner.save() {
        Ok(data) => data,
        Err(e) => {
            warn!("Could not serialise reply: {}", e);
            return None;
        }
    };

    Some((SocketAddrV6::new(destination, port, 0, scope), data))
}

/// Frame a message for the bulk leasequery TCP stream: a 16-bit length
/// prefix followed by the wire form.
pub fn tcp_frame(message: &Message) -> Result<Vec<u8>, ServerError> {
    let data = message.save()?;
    let len = u16::try_from(data.len()).map_err(|_| {
        ServerError::Proto(sedge_proto::Error::TooLong {
            element: "bulk leasequery frame",
            max: u16::MAX as usize,
        })
    })?;

    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&data);

    Ok(frame)
}

/// Read one length-prefixed message from a bulk leasequery stream.
/// `Ok(None)` means the peer closed the connection at a frame boundary.
pub fn read_tcp_frame(stream: &mut impl std::io::Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut length = [0u8; 2];

    match stream.read(&mut length)? {
        0 => return Ok(None),
        1 => {
            let mut rest = [0u8; 1];
            read_exact_or_eof(stream, &mut rest)?;
            length[1] = rest[0];
        }
        _ => {}
    }

    let len = u16::from_be_bytes(length) as usize;
    let mut data = vec![0u8; len];
    std::io::Read::read_exact(stream, &mut data)?;

    Ok(Some(data))
}

fn read_exact_or_eof(stream: &mut impl std::io::Read, buf: &mut [u8]) -> std::io::Result<()> {
    std::io::Read::read_exact(stream, buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated frame header")
        } else {
            e
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::message::ClientServerMessage;

    #[test]
    fn wrap_sets_link_and_peer() {
        let solicit = Message::ClientServer(ClientServerMessage::new(
            MessageType::Solicit,
            [1, 2, 3],
        ));
        let wrapped = wrap_incoming(
            solicit,
            "eth0",
            "2001:db8::1".parse().unwrap(),
            "fe80::aa".parse().unwrap(),
        );

        let relay = wrapped.as_relay().unwrap();
        assert_eq!(relay.hop_count, 0);
        assert_eq!(relay.link_address, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(relay.peer_address, "fe80::aa".parse::<Ipv6Addr>().unwrap());
        assert_eq!(relay.interface_id(), Some(&b"eth0"[..]));
        assert_eq!(
            relay.relayed_message().unwrap().message_type(),
            MessageType::Solicit
        );
    }

    #[test]
    fn wrap_increments_hop_count_for_relayed() {
        let mut inner_relay = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 3,
            link_address: "2001:db8:1::1".parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: Vec::new(),
        };
        inner_relay.set_relayed_message(Message::ClientServer(ClientServerMessage::new(
            MessageType::Solicit,
            [1, 2, 3],
        )));

        let wrapped = wrap_incoming(
            Message::Relay(inner_relay),
            "eth0",
            "2001:db8::1".parse().unwrap(),
            "2001:db8:fe::1".parse().unwrap(),
        );
        assert_eq!(wrapped.as_relay().unwrap().hop_count, 4);
    }

    #[test]
    fn reply_unwraps_synthetic_hop() {
        let mut request = ClientServerMessage::new(MessageType::Solicit, [1, 2, 3]);
        request
            .options
            .push(DhcpOption::ElapsedTime(0));

        let wrapped = wrap_incoming(
            Message::ClientServer(request),
            "eth0",
            "2001:db8::1".parse().unwrap(),
            "fe80::aa".parse().unwrap(),
        );

        let mut bundle = TransactionBundle::new(wrapped, true, false);
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));

        let (destination, data) = outgoing_datagram(&mut bundle, 7).unwrap();
        // a direct client: reply goes to the client port, scoped to the
        // receiving interface because the source was link-local
        assert_eq!(destination.port(), CLIENT_PORT);
        assert_eq!(destination.scope_id(), 7);
        assert_eq!(*destination.ip(), "fe80::aa".parse::<Ipv6Addr>().unwrap());

        let reply = Message::parse(&data).unwrap();
        assert_eq!(reply.message_type(), MessageType::Advertise);
    }

    #[test]
    fn reply_to_relay_keeps_relay_wrapping() {
        let mut real_relay = RelayMessage {
            message_type: MessageType::RelayForward,
            hop_count: 0,
            link_address: "2001:db8:ffff:1::1".parse().unwrap(),
            peer_address: "fe80::1".parse().unwrap(),
            options: Vec::new(),
        };
        real_relay.set_relayed_message(Message::ClientServer(ClientServerMessage::new(
            MessageType::Solicit,
            [1, 2, 3],
        )));

        let wrapped = wrap_incoming(
            Message::Relay(real_relay),
            "eth0",
            "2001:db8::1".parse().unwrap(),
            "2001:db8:fe::1".parse().unwrap(),
        );

        let mut bundle = TransactionBundle::new(wrapped, true, false);
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));

        let (destination, data) = outgoing_datagram(&mut bundle, 7).unwrap();
        assert_eq!(destination.port(), SERVER_PORT);
        assert_eq!(
            *destination.ip(),
            "2001:db8:fe::1".parse::<Ipv6Addr>().unwrap()
        );

        // the relay sees a relay-reply wrapping the advertise
        let reply = Message::parse(&data).unwrap();
        let relay = reply.as_relay().unwrap();
        assert_eq!(relay.message_type, MessageType::RelayReply);
        assert_eq!(
            relay.relayed_message().unwrap().message_type(),
            MessageType::Advertise
        );
    }

    #[test]
    fn tcp_framing_round_trip() {
        let message = Message::ClientServer(ClientServerMessage::new(
            MessageType::LeasequeryReply,
            [1, 2, 3],
        ));
        let frame = tcp_frame(&message).unwrap();
        assert_eq!(frame[0..2], (frame.len() as u16 - 2).to_be_bytes());

        let mut cursor = std::io::Cursor::new(frame);
        let data = read_tcp_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(Message::parse(&data).unwrap(), message);
        assert!(read_tcp_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn tcp_stream_of_frames() {
        // reply + data + done back to back, as a bulk stream sends them
        let messages = [
            MessageType::LeasequeryReply,
            MessageType::LeasequeryData,
            MessageType::LeasequeryDone,
        ]
        .map(|message_type| {
            Message::ClientServer(ClientServerMessage::new(message_type, [7, 7, 7]))
        });

        let mut stream = Vec::new();
        for message in &messages {
            stream.extend_from_slice(&tcp_frame(message).unwrap());
        }

        let mut cursor = std::io::Cursor::new(stream);
        for expected in &messages {
            let data = read_tcp_frame(&mut cursor).unwrap().unwrap();
            assert_eq!(&Message::parse(&data).unwrap(), expected);
        }
        assert!(read_tcp_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let message = Message::ClientServer(ClientServerMessage::new(
            MessageType::LeasequeryReply,
            [1, 2, 3],
        ));
        let mut frame = tcp_frame(&message).unwrap();
        frame.truncate(frame.len() - 1);

        let mut cursor = std::io::Cursor::new(frame);
        assert!(read_tcp_frame(&mut cursor).is_err());
    }
}
