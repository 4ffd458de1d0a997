//! Identity Association options: IA_NA, IA_TA, IA_PD and their address and
//! prefix children (RFC 8415 sections 21.4, 21.5, 21.6, 21.21, 21.22).

use core::net::Ipv6Addr;

use crate::bytes::{BytesIn, BytesOut};
use crate::options::{parse_options, write_options, DhcpOption, StatusCodeOption};
use crate::Error;

/// Identity Association for Non-temporary Addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IaNaOption {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: Vec<DhcpOption>,
}

impl IaNaOption {
    pub fn new(iaid: u32) -> Self {
        Self {
            iaid,
            t1: 0,
            t2: 0,
            options: Vec::new(),
        }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            iaid: bytes.be_u32()?,
            t1: bytes.be_u32()?,
            t2: bytes.be_u32()?,
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.be_u32(self.iaid).be_u32(self.t1).be_u32(self.t2);
        write_options(&self.options, out)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &IaAddressOption> {
        self.options.iter().filter_map(|option| match option {
            DhcpOption::IaAddress(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn status_code(&self) -> Option<&StatusCodeOption> {
        status_of(&self.options)
    }
}

/// Identity Association for Temporary Addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IaTaOption {
    pub iaid: u32,
    pub options: Vec<DhcpOption>,
}

impl IaTaOption {
    pub fn new(iaid: u32) -> Self {
        Self {
            iaid,
            options: Vec::new(),
        }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            iaid: bytes.be_u32()?,
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.be_u32(self.iaid);
        write_options(&self.options, out)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &IaAddressOption> {
        self.options.iter().filter_map(|option| match option {
            DhcpOption::IaAddress(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn status_code(&self) -> Option<&StatusCodeOption> {
        status_of(&self.options)
    }
}

/// A single address inside an IA_NA or IA_TA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IaAddressOption {
    pub address: Ipv6Addr,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub options: Vec<DhcpOption>,
}

impl IaAddressOption {
    pub fn new(address: Ipv6Addr, preferred_lifetime: u32, valid_lifetime: u32) -> Self {
        Self {
            address,
            preferred_lifetime,
            valid_lifetime,
            options: Vec::new(),
        }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            address: Ipv6Addr::from(bytes.arr::<16>()?),
            preferred_lifetime: bytes.be_u32()?,
            valid_lifetime: bytes.be_u32()?,
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.push(&self.address.octets())
            .be_u32(self.preferred_lifetime)
            .be_u32(self.valid_lifetime);
        write_options(&self.options, out)
    }
}

/// Identity Association for Prefix Delegation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IaPdOption {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: Vec<DhcpOption>,
}

impl IaPdOption {
    pub fn new(iaid: u32) -> Self {
        Self {
            iaid,
            t1: 0,
            t2: 0,
            options: Vec::new(),
        }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            iaid: bytes.be_u32()?,
            t1: bytes.be_u32()?,
            t2: bytes.be_u32()?,
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.be_u32(self.iaid).be_u32(self.t1).be_u32(self.t2);
        write_options(&self.options, out)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &IaPrefixOption> {
        self.options.iter().filter_map(|option| match option {
            DhcpOption::IaPrefix(prefix) => Some(prefix),
            _ => None,
        })
    }

    pub fn status_code(&self) -> Option<&StatusCodeOption> {
        status_of(&self.options)
    }
}

/// A delegated prefix inside an IA_PD.
///
/// The prefix is kept exactly as received (length and address octets), so a
/// prefix with set host bits round-trips unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IaPrefixOption {
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub prefix_length: u8,
    pub prefix: Ipv6Addr,
    pub options: Vec<DhcpOption>,
}

impl IaPrefixOption {
    pub fn new(prefix: Ipv6Addr, prefix_length: u8, preferred_lifetime: u32, valid_lifetime: u32) -> Self {
        Self {
            preferred_lifetime,
            valid_lifetime,
            prefix_length,
            prefix,
            options: Vec::new(),
        }
    }

    pub(crate) fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            preferred_lifetime: bytes.be_u32()?,
            valid_lifetime: bytes.be_u32()?,
            prefix_length: bytes.byte()?,
            prefix: Ipv6Addr::from(bytes.arr::<16>()?),
            options: parse_options(bytes)?,
        })
    }

    pub(crate) fn write_payload(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.be_u32(self.preferred_lifetime)
            .be_u32(self.valid_lifetime)
            .byte(self.prefix_length)
            .push(&self.prefix.octets());
        write_options(&self.options, out)
    }

    pub fn validate_fields(&self) -> Result<(), Error> {
        if self.prefix_length > 128 {
            return Err(Error::ReservedValue("IAPrefixOption prefix length"));
        }

        Ok(())
    }

    /// First address covered by the prefix.
    pub fn first_address(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.prefix) & self.mask())
    }

    /// Last address covered by the prefix.
    pub fn last_address(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.prefix) | !self.mask())
    }

    fn mask(&self) -> u128 {
        if self.prefix_length == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(self.prefix_length.min(128)))
        }
    }
}

fn status_of(options: &[DhcpOption]) -> Option<&StatusCodeOption> {
    options.iter().find_map(|option| match option {
        DhcpOption::StatusCode(status) => Some(status),
        _ => None,
    })
}

/// Whether an element carrying these options was accepted: no status code at
/// all, or an explicit `Success`.
pub fn is_accepted(status: Option<&StatusCodeOption>) -> bool {
    status.map_or(true, |status| status.status_code == crate::options::STATUS_SUCCESS)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_range() {
        let prefix = IaPrefixOption::new("2001:db8:100::".parse().unwrap(), 56, 375, 600);
        assert_eq!(
            prefix.first_address(),
            "2001:db8:100::".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            prefix.last_address(),
            "2001:db8:1ff:ffff:ffff:ffff:ffff:ffff".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn zero_length_prefix_covers_everything() {
        let prefix = IaPrefixOption::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);
        assert_eq!(prefix.first_address(), Ipv6Addr::UNSPECIFIED);
        assert_eq!(
            prefix.last_address(),
            "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse::<Ipv6Addr>().unwrap()
        );
    }
}
