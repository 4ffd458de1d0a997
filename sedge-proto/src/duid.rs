//! DHCP Unique Identifiers (RFC 8415 section 11).
//!
//! A DUID is a 16-bit type code followed by up to 126 octets of identifier
//! data. Unrecognised type codes round-trip through [`Duid::Unknown`] so that
//! foreign identifiers survive storage and comparison unchanged.

use core::fmt;
use core::hash::{Hash, Hasher};

use crate::bytes::{BytesIn, BytesOut};
use crate::Error;

pub const DUID_LLT: u16 = 1;
pub const DUID_EN: u16 = 2;
pub const DUID_LL: u16 = 3;

/// The longest link-layer address a DUID-LLT can carry: 128 octets of DUID
/// minus the type, hardware-type and time fields.
pub const MAX_LLT_ADDRESS_LEN: usize = 120;
pub const MAX_EN_IDENTIFIER_LEN: usize = 122;
pub const MAX_LL_ADDRESS_LEN: usize = 124;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Duid {
    /// DUID-LLT: hardware type, creation time, link-layer address.
    LinkLayerTime {
        hardware_type: u16,
        time: u32,
        link_layer_address: Vec<u8>,
    },
    /// DUID-EN: IANA enterprise number plus a vendor-assigned identifier.
    Enterprise {
        enterprise_number: u32,
        identifier: Vec<u8>,
    },
    /// DUID-LL: hardware type and link-layer address.
    LinkLayer {
        hardware_type: u16,
        link_layer_address: Vec<u8>,
    },
    /// Any other type code, kept as raw payload.
    Unknown { duid_type: u16, data: Vec<u8> },
}

impl Duid {
    pub fn duid_type(&self) -> u16 {
        match self {
            Self::LinkLayerTime { .. } => DUID_LLT,
            Self::Enterprise { .. } => DUID_EN,
            Self::LinkLayer { .. } => DUID_LL,
            Self::Unknown { duid_type, .. } => *duid_type,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::LinkLayerTime { .. } => "LinkLayerTimeDUID",
            Self::Enterprise { .. } => "EnterpriseDUID",
            Self::LinkLayer { .. } => "LinkLayerDUID",
            Self::Unknown { .. } => "UnknownDUID",
        }
    }

    /// Parse a DUID from the whole of `data`.
    ///
    /// DUIDs carry no internal length, so the caller decides where the DUID
    /// ends (an option length, a fixed field, ...).
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);
        let duid_type = bytes.be_u16()?;

        let duid = match crate::registry::duids().decoder(duid_type) {
            Some(decode) => decode(duid_type, &mut bytes)?,
            None => Self::Unknown {
                duid_type,
                data: bytes.remaining().to_vec(),
            },
        };

        Ok(duid)
    }

    pub(crate) fn parse_llt(_duid_type: u16, bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self::LinkLayerTime {
            hardware_type: bytes.be_u16()?,
            time: bytes.be_u32()?,
            link_layer_address: bytes.remaining().to_vec(),
        })
    }

    pub(crate) fn parse_en(_duid_type: u16, bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self::Enterprise {
            enterprise_number: bytes.be_u32()?,
            identifier: bytes.remaining().to_vec(),
        })
    }

    pub(crate) fn parse_ll(_duid_type: u16, bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self::LinkLayer {
            hardware_type: bytes.be_u16()?,
            link_layer_address: bytes.remaining().to_vec(),
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        self.validate()?;

        let mut out = BytesOut::new(buf);
        out.be_u16(self.duid_type());

        match self {
            Self::LinkLayerTime {
                hardware_type,
                time,
                link_layer_address,
            } => {
                out.be_u16(*hardware_type).be_u32(*time).push(link_layer_address);
            }
            Self::Enterprise {
                enterprise_number,
                identifier,
            } => {
                out.be_u32(*enterprise_number).push(identifier);
            }
            Self::LinkLayer {
                hardware_type,
                link_layer_address,
            } => {
                out.be_u16(*hardware_type).push(link_layer_address);
            }
            Self::Unknown { data, .. } => {
                out.push(data);
            }
        }

        Ok(())
    }

    pub fn save(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::LinkLayerTime {
                link_layer_address, ..
            } if link_layer_address.len() > MAX_LLT_ADDRESS_LEN => Err(Error::TooLong {
                element: "DUID-LLT link-layer address",
                max: MAX_LLT_ADDRESS_LEN,
            }),
            Self::Enterprise { identifier, .. } if identifier.len() > MAX_EN_IDENTIFIER_LEN => {
                Err(Error::TooLong {
                    element: "DUID-EN identifier",
                    max: MAX_EN_IDENTIFIER_LEN,
                })
            }
            Self::LinkLayer {
                link_layer_address, ..
            } if link_layer_address.len() > MAX_LL_ADDRESS_LEN => Err(Error::TooLong {
                element: "DUID-LL link-layer address",
                max: MAX_LL_ADDRESS_LEN,
            }),
            _ => Ok(()),
        }
    }

    /// Lower-case hex of the wire form, the identity used by the leasequery
    /// store and the static assignment mappings.
    pub fn hex(&self) -> String {
        hex::encode(self.save().unwrap_or_default())
    }

    /// Inverse of [`Duid::hex`].
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let data = hex::decode(s).map_err(|_| Error::InvalidLength("DUID hex string"))?;
        Self::parse(&data)
    }
}

impl Hash for Duid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // DUIDs are identified by their wire form
        state.write(&self.save().unwrap_or_default());
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkLayerTime {
                hardware_type,
                time,
                link_layer_address,
            } => write!(
                f,
                "LinkLayerTimeDUID {{ hardware_type: {}, time: {}, link_layer_address: {} }}",
                hardware_type,
                time,
                hex::encode(link_layer_address)
            ),
            Self::Enterprise {
                enterprise_number,
                identifier,
            } => write!(
                f,
                "EnterpriseDUID {{ enterprise_number: {}, identifier: {} }}",
                enterprise_number,
                hex::encode(identifier)
            ),
            Self::LinkLayer {
                hardware_type,
                link_layer_address,
            } => write!(
                f,
                "LinkLayerDUID {{ hardware_type: {}, link_layer_address: {} }}",
                hardware_type,
                hex::encode(link_layer_address)
            ),
            Self::Unknown { duid_type, data } => write!(
                f,
                "UnknownDUID {{ duid_type: {}, data: {} }}",
                duid_type,
                hex::encode(data)
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn llt_round_trip() {
        let wire = [
            0x00, 0x01, 0x00, 0x01, 0x1c, 0x39, 0xcf, 0x88, 0x08, 0x00, 0x27, 0xfe, 0x8f, 0x95,
        ];
        let duid = Duid::parse(&wire).unwrap();
        assert_eq!(
            duid,
            Duid::LinkLayerTime {
                hardware_type: 1,
                time: 0x1c39cf88,
                link_layer_address: vec![0x08, 0x00, 0x27, 0xfe, 0x8f, 0x95],
            }
        );
        assert_eq!(duid.save().unwrap(), wire);
    }

    #[test]
    fn ll_round_trip() {
        let wire = [0x00, 0x03, 0x00, 0x01, 0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1];
        let duid = Duid::parse(&wire).unwrap();
        assert_eq!(
            duid,
            Duid::LinkLayer {
                hardware_type: 1,
                link_layer_address: vec![0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1],
            }
        );
        assert_eq!(duid.save().unwrap(), wire);
    }

    #[test]
    fn en_round_trip() {
        let wire = [
            0x00, 0x02, 0x00, 0x00, 0x00, 0x09, 0x0c, 0xc0, 0x84, 0xdd, 0x03, 0x00, 0x09, 0x12,
        ];
        let duid = Duid::parse(&wire).unwrap();
        assert_eq!(
            duid,
            Duid::Enterprise {
                enterprise_number: 9,
                identifier: vec![0x0c, 0xc0, 0x84, 0xdd, 0x03, 0x00, 0x09, 0x12],
            }
        );
        assert_eq!(duid.save().unwrap(), wire);
    }

    #[test]
    fn unknown_type_round_trips_opaque() {
        // The auto-generated server DUID uses a raw vendor prefix that is not
        // a registered DUID type.
        let wire = [0x53, 0x4a, 0x4d, 0x53, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc];
        let duid = Duid::parse(&wire).unwrap();
        assert_eq!(duid.duid_type(), 0x534a);
        assert_eq!(duid.save().unwrap(), wire);
    }

    #[test]
    fn truncated_fails() {
        assert_eq!(Duid::parse(&[0x00]), Err(Error::LengthOverflow));
        assert_eq!(Duid::parse(&[0x00, 0x01, 0x00]), Err(Error::LengthOverflow));
    }

    #[test]
    fn oversized_address_rejected_on_save() {
        let duid = Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![0; MAX_LL_ADDRESS_LEN + 1],
        };
        assert!(matches!(duid.save(), Err(Error::TooLong { .. })));
    }

    #[test]
    fn hex_form_is_stable() {
        let duid = Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1],
        };
        assert_eq!(duid.hex(), "000300013431c43cb2f1");
        assert_eq!(Duid::from_hex("000300013431c43cb2f1").unwrap(), duid);
    }
}
