use std::fmt::Display;

use tracing::{debug, trace};

use crate::{
    Error, FmtpMessage, FmtpType, HEADER_LEN, Header, Identification, SystemSignal,
};

/// A complete FMTP frame, header plus body.
///
/// The header length always matches the body, every constructor enforces it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FmtpPacket {
    pub header: Header,
    data: Vec<u8>,
}

/// Decoded content of a received frame, split by message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Data(FmtpMessage),
    /// Raw identification body, its meaning depends on the handshake step.
    Identification(Vec<u8>),
    System(SystemSignal),
}

impl FmtpPacket {
    /// # Errors
    ///
    /// Returns [`Error::BodyTooLarge`] if `data` does not fit a single frame.
    pub fn new(typ: FmtpType, data: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let data = data.into();
        Ok(Self {
            header: Header::new(typ, data.len())?,
            data,
        })
    }

    /// Joins a decoded header with the body read after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TruncatedBody`] if `data` is not as long as announced.
    pub fn from_parts(header: Header, data: Vec<u8>) -> Result<Self, Error> {
        if data.len() != header.body_len() {
            return Err(Error::TruncatedBody {
                expected: header.body_len(),
                got: data.len(),
            });
        }
        Ok(Self { header, data })
    }

    /// Decodes one frame from the start of `bytes`, trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Header errors as in [`Header::decode`], [`Error::UnexpectedEof`] for
    /// less than 5 bytes and [`Error::TruncatedBody`] for a short body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let Some((header, rest)) = bytes.split_at_checked(HEADER_LEN) else {
            return Err(Error::UnexpectedEof { got: bytes.len() });
        };
        let header = Header::decode(header)?;
        let Some(body) = rest.get(..header.body_len()) else {
            return Err(Error::TruncatedBody {
                expected: header.body_len(),
                got: rest.len(),
            });
        };
        Ok(Self {
            header,
            data: body.to_owned(),
        })
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + self.data.len());
        packet.extend(self.header.encode());
        packet.extend(self.data);
        packet
    }

    #[must_use]
    pub fn from_msg(msg: FmtpMessage) -> Self {
        let typ = msg.typ();
        let packet = Self::checked(typ, msg.into_data());
        debug!("Data packet: {packet}");

        packet
    }

    #[must_use]
    pub fn identification(identification: &Identification) -> Self {
        let packet = Self::checked(FmtpType::Identification, identification.encode());
        debug!("Identification packet: {packet}");

        packet
    }

    #[must_use]
    pub fn system(signal: SystemSignal) -> Self {
        let packet = Self::checked(FmtpType::System, signal.code().to_vec());
        trace!("System packet: {packet}");

        packet
    }

    // callers guarantee the body fits
    fn checked(typ: FmtpType, data: Vec<u8>) -> Self {
        Self {
            header: Header::from_checked(typ, data.len()),
            data,
        }
    }

    /// Total frame size on the wire.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    #[must_use]
    pub fn typ(&self) -> Option<FmtpType> {
        self.header.typ()
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Interprets the body according to the header type.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownType`] for type bytes outside of 1..=4 and
    /// [`Error::MalformedSystemSignal`] for system bodies not 2 bytes long.
    pub fn into_payload(self) -> Result<Payload, Error> {
        let raw = self.header.raw_type();
        Ok(match self.header.typ().ok_or(Error::UnknownType(raw))? {
            FmtpType::Operational => Payload::Data(FmtpMessage::Operational(self.data)),
            FmtpType::Operator => Payload::Data(FmtpMessage::Operator(self.data)),
            FmtpType::Identification => Payload::Identification(self.data),
            FmtpType::System => Payload::System(SystemSignal::decode(&self.data)?),
        })
    }
}

impl Display for FmtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.typ() {
            Some(typ) => write!(f, "{typ:?}: ")?,
            None => write!(f, "type {}: ", self.header.raw_type())?,
        }
        match std::str::from_utf8(&self.data) {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "{:?}", self.data),
        }
    }
}
