use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, TryFromBytes, big_endian::U16};

use crate::Error;

/// FMTP version carried by every header we emit.
pub const VERSION: u8 = 0x02;
/// Value of the reserved header byte.
pub const RESERVED: u8 = 0x00;
/// Size of the fixed header.
pub const HEADER_LEN: usize = 5;
/// Largest value of the header length field (header + body).
pub const MAX_LENGTH: u16 = 32761;
/// Largest body a single message can carry.
pub const MAX_BODY_LEN: usize = MAX_LENGTH as usize - HEADER_LEN;

/// Message type, byte 4 of the header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
pub enum FmtpType {
    /// Operational user data.
    Operational = 1,
    /// Operator user data.
    Operator,
    /// ID Request or ID Response of the handshake.
    Identification,
    /// STARTUP, SHUTDOWN or HEARTBEAT.
    System,
}

impl FmtpType {
    /// Maps a raw header type byte, `None` outside of 1..=4.
    #[must_use]
    pub fn from_u8(typ: u8) -> Option<Self> {
        Self::try_read_from_bytes(&[typ]).ok()
    }
}

/// The 5 byte FMTP header.
///
/// ```text
/// byte 0:    version
/// byte 1:    reserved
/// bytes 2-3: total length (header + body), big endian
/// byte 4:    message type
/// ```
///
/// Decoding only validates the length field, version, reserved and type are
/// kept as received and left to the message type specific decoders.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Header {
    version: u8,
    reserved: u8,
    length: U16,
    typ: u8,
}

impl Header {
    /// Creates a version 2 header for a body of `body_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BodyTooLarge`] if `body_len` exceeds [`MAX_BODY_LEN`].
    pub fn new(typ: FmtpType, body_len: usize) -> Result<Self, Error> {
        if body_len > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self::from_checked(typ, body_len))
    }

    pub(crate) fn from_checked(typ: FmtpType, body_len: usize) -> Self {
        debug_assert!(body_len <= MAX_BODY_LEN);
        Self {
            version: VERSION,
            reserved: RESERVED,
            #[expect(clippy::cast_possible_truncation, reason = "length checked by caller")]
            length: ((HEADER_LEN + body_len) as u16).into(),
            typ: typ as u8,
        }
    }

    /// The header as sent on the wire.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0; HEADER_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Decodes exactly [`HEADER_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] if `bytes` is not exactly 5 bytes
    /// long or the length field lies outside of `5..=32761`.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let header = Self::read_from_bytes(bytes)
            .map_err(|_| Error::MalformedHeader("expected exactly 5 bytes"))?;

        if header.length.get() > MAX_LENGTH {
            return Err(Error::MalformedHeader(
                "indicated length larger than max length",
            ));
        }
        if usize::from(header.length.get()) < HEADER_LEN {
            return Err(Error::MalformedHeader(
                "indicated length smaller than nominal header length",
            ));
        }
        Ok(header)
    }

    /// Version byte as received.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Reserved byte as received.
    #[must_use]
    pub fn reserved(&self) -> u8 {
        self.reserved
    }

    /// Total length of header and body.
    #[must_use]
    pub fn length(&self) -> u16 {
        self.length.get()
    }

    /// Length of the body following the header.
    #[must_use]
    pub fn body_len(&self) -> usize {
        usize::from(self.length.get()).saturating_sub(HEADER_LEN)
    }

    /// Raw type byte as found on the wire.
    #[must_use]
    pub fn raw_type(&self) -> u8 {
        self.typ
    }

    /// Decoded message type, `None` for unknown type bytes.
    #[must_use]
    pub fn typ(&self) -> Option<FmtpType> {
        FmtpType::from_u8(self.typ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmtp_type_to_u8() {
        assert_eq!(FmtpType::Operational as u8, 1);
        assert_eq!(FmtpType::Operator as u8, 2);
        assert_eq!(FmtpType::Identification as u8, 3);
        assert_eq!(FmtpType::System as u8, 4);
        assert_eq!(FmtpType::from_u8(4), Some(FmtpType::System));
        assert_eq!(FmtpType::from_u8(0), None);
        assert_eq!(FmtpType::from_u8(5), None);
    }

    #[test]
    fn fmtp_header_to_bytes() {
        let header = Header::new(FmtpType::Operator, 0).unwrap();
        assert_eq!([2, 0, 0, 5, 2], header.encode());

        let header = Header::new(FmtpType::System, 2).unwrap();
        assert_eq!([2, 0, 0, 7, 4], header.encode());
    }

    #[test]
    fn decode_keeps_unvalidated_fields() {
        let header = Header::decode(&[7, 9, 0, 6, 42]).unwrap();
        assert_eq!(header.version(), 7);
        assert_eq!(header.reserved(), 9);
        assert_eq!(header.length(), 6);
        assert_eq!(header.body_len(), 1);
        assert_eq!(header.raw_type(), 42);
        assert_eq!(header.typ(), None);
    }

    #[test]
    fn decode_boundaries() {
        let max = Header::new(FmtpType::Operational, MAX_BODY_LEN).unwrap();
        assert_eq!(max.length(), MAX_LENGTH);
        assert_eq!(Header::decode(&max.encode()).unwrap(), max);

        let [hi, lo] = (MAX_LENGTH + 1).to_be_bytes();
        assert!(matches!(
            Header::decode(&[2, 0, hi, lo, 1]),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            Header::decode(&[2, 0, 0, 4, 1]),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn every_type_and_body_len_decodes_back() {
        for typ in [
            FmtpType::Operational,
            FmtpType::Operator,
            FmtpType::Identification,
            FmtpType::System,
        ] {
            for body_len in 0..=MAX_BODY_LEN {
                let header = Header::new(typ, body_len).unwrap();
                let decoded = Header::decode(&header.encode()).unwrap();
                assert_eq!(decoded, header);
                assert_eq!(decoded.body_len(), body_len);
                assert_eq!(decoded.typ(), Some(typ));
            }
        }
    }

    #[test]
    fn every_version_and_reserved_byte_is_kept() {
        for version in 0..=u8::MAX {
            for reserved in 0..=u8::MAX {
                for typ in 1..=4 {
                    let bytes = [version, reserved, 0, 9, typ];
                    let header = Header::decode(&bytes).unwrap();
                    assert_eq!(header.encode(), bytes);
                    assert_eq!(header.version(), version);
                    assert_eq!(header.reserved(), reserved);
                }
            }
        }
    }

    #[test]
    fn decode_requires_exact_size() {
        assert!(Header::decode(&[2, 0, 0, 5]).is_err());
        assert!(Header::decode(&[2, 0, 0, 5, 1, 0]).is_err());
    }

    #[test]
    fn new_rejects_oversized_body() {
        assert!(matches!(
            Header::new(FmtpType::Operator, MAX_BODY_LEN + 1),
            Err(Error::BodyTooLarge { size: 32757, max: 32756 })
        ));
    }
}
