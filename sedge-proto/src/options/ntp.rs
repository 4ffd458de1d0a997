//! The NTP Server option and its sub-options (RFC 5908).
//!
//! This is the one option family with its own sub-option category and
//! registry: sub-option codes are a separate numbering space from DHCPv6
//! option codes.

use core::net::Ipv6Addr;

use crate::bytes::{BytesIn, BytesOut};
use crate::name::DomainName;
use crate::registry;
use crate::Error;

pub const NTP_SUBOPTION_SRV_ADDR: u16 = 1;
pub const NTP_SUBOPTION_MC_ADDR: u16 = 2;
pub const NTP_SUBOPTION_SRV_FQDN: u16 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NtpSubOption {
    /// A unicast NTP server address.
    ServerAddress(Ipv6Addr),
    /// A multicast group to listen on.
    MulticastAddress(Ipv6Addr),
    /// An NTP server name to resolve.
    ServerFqdn(DomainName),
    Unknown { suboption_type: u16, data: Vec<u8> },
}

impl NtpSubOption {
    pub fn code(&self) -> u16 {
        match self {
            Self::ServerAddress(_) => NTP_SUBOPTION_SRV_ADDR,
            Self::MulticastAddress(_) => NTP_SUBOPTION_MC_ADDR,
            Self::ServerFqdn(_) => NTP_SUBOPTION_SRV_FQDN,
            Self::Unknown { suboption_type, .. } => *suboption_type,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::ServerAddress(_) => "NTPServerAddressSubOption",
            Self::MulticastAddress(_) => "NTPMulticastAddressSubOption",
            Self::ServerFqdn(_) => "NTPServerFQDNSubOption",
            Self::Unknown { .. } => "UnknownNTPSubOption",
        }
    }

    pub fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        let code = bytes.be_u16()?;
        let len = bytes.be_u16()? as usize;
        let payload = bytes.slice(len)?;
        let mut body = BytesIn::new(payload);

        let suboption = match registry::ntp_suboptions().decoder(code) {
            Some(decode) => {
                let suboption = decode(&mut body)?;
                if !body.is_empty() {
                    return Err(Error::InvalidLength("NTP sub-option"));
                }
                suboption
            }
            None => Self::Unknown {
                suboption_type: code,
                data: payload.to_vec(),
            },
        };

        Ok(suboption)
    }

    pub(crate) fn parse_srv_addr(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self::ServerAddress(Ipv6Addr::from(bytes.arr::<16>()?)))
    }

    pub(crate) fn parse_mc_addr(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self::MulticastAddress(Ipv6Addr::from(bytes.arr::<16>()?)))
    }

    pub(crate) fn parse_srv_fqdn(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        let name = DomainName::parse(bytes)?;
        if !bytes.is_empty() {
            return Err(Error::InvalidLength("NTPServerFQDNSubOption"));
        }

        Ok(Self::ServerFqdn(name))
    }

    pub fn write(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.be_u16(self.code());
        let len_pos = out.reserve_len();

        match self {
            Self::ServerAddress(address) | Self::MulticastAddress(address) => {
                out.push(&address.octets());
            }
            Self::ServerFqdn(name) => {
                let mut buf = Vec::new();
                name.write(&mut buf)?;
                out.push(&buf);
            }
            Self::Unknown { data, .. } => {
                out.push(data);
            }
        }

        out.patch_len(len_pos)
    }

    pub fn parse_list(bytes: &mut BytesIn<'_>) -> Result<Vec<Self>, Error> {
        let mut suboptions = Vec::new();
        while !bytes.is_empty() {
            suboptions.push(Self::parse(bytes)?);
        }

        Ok(suboptions)
    }
}

impl core::fmt::Display for NtpSubOption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ServerAddress(address) => {
                write!(f, "NTPServerAddressSubOption {{ address: {} }}", address)
            }
            Self::MulticastAddress(address) => {
                write!(f, "NTPMulticastAddressSubOption {{ address: {} }}", address)
            }
            Self::ServerFqdn(name) => write!(f, "NTPServerFQDNSubOption {{ fqdn: {} }}", name),
            Self::Unknown {
                suboption_type,
                data,
            } => write!(
                f,
                "UnknownNTPSubOption {{ suboption_type: {}, data: {} }}",
                suboption_type,
                hex::encode(data)
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::{DhcpOption, OPTION_NTP_SERVER};

    #[test]
    fn ntp_option_round_trip() {
        let wire: Vec<u8> = vec![
            0x00, 0x38, 0x00, 0x29, // OPTION_NTP_SERVER, length 41
            0x00, 0x01, 0x00, 0x10, // srv-addr sub-option
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, //
            0x00, 0x03, 0x00, 0x11, // srv-fqdn sub-option
            0x03, b'n', b't', b'p', 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'o',
            b'r', b'g', 0x00,
        ];

        let mut bytes = BytesIn::new(&wire);
        let option = DhcpOption::parse(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(option.code(), OPTION_NTP_SERVER);

        match &option {
            DhcpOption::NtpServer(suboptions) => {
                assert_eq!(suboptions.len(), 2);
                assert!(matches!(suboptions[0], NtpSubOption::ServerAddress(_)));
                match &suboptions[1] {
                    NtpSubOption::ServerFqdn(name) => {
                        assert_eq!(name.to_string(), "ntp.example.org")
                    }
                    other => panic!("unexpected sub-option {:?}", other),
                }
            }
            other => panic!("unexpected option {:?}", other),
        }

        assert_eq!(option.save().unwrap(), wire);
    }

    #[test]
    fn unknown_suboption_round_trips() {
        let wire: Vec<u8> = vec![
            0x00, 0x38, 0x00, 0x08, // OPTION_NTP_SERVER, length 8
            0x00, 0x63, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef,
        ];

        let mut bytes = BytesIn::new(&wire);
        let option = DhcpOption::parse(&mut bytes).unwrap();
        match &option {
            DhcpOption::NtpServer(suboptions) => {
                assert_eq!(
                    suboptions[0],
                    NtpSubOption::Unknown {
                        suboption_type: 0x63,
                        data: vec![0xde, 0xad, 0xbe, 0xef],
                    }
                );
            }
            other => panic!("unexpected option {:?}", other),
        }
        assert_eq!(option.save().unwrap(), wire);
    }
}
