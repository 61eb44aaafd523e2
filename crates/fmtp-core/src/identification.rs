//! Bodies of Identification and System messages.

use std::fmt::Display;

use crate::{Error, FmtpIdentifier};

/// Identification message sent for validation: `<sender>-<receiver>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdRequest {
    sender: FmtpIdentifier,
    receiver: FmtpIdentifier,
}

impl IdRequest {
    #[must_use]
    pub fn new(sender: FmtpIdentifier, receiver: FmtpIdentifier) -> Self {
        Self { sender, receiver }
    }

    #[must_use]
    pub fn sender(&self) -> &FmtpIdentifier {
        &self.sender
    }

    #[must_use]
    pub fn receiver(&self) -> &FmtpIdentifier {
        &self.receiver
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.sender.len() + 1 + self.receiver.len());
        payload.extend(&*self.sender);
        payload.push(b'-');
        payload.extend(&*self.receiver);
        payload
    }

    /// # Errors
    ///
    /// Returns [`Error::MalformedIdRequest`] unless the body splits into
    /// exactly two valid identifiers around a single hyphen.
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let mut parts = body.split(|b| *b == b'-');
        let (Some(sender), Some(receiver), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedIdRequest);
        };
        Ok(Self {
            sender: FmtpIdentifier::new(sender).map_err(|_| Error::MalformedIdRequest)?,
            receiver: FmtpIdentifier::new(receiver).map_err(|_| Error::MalformedIdRequest)?,
        })
    }
}

impl Display for IdRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.sender, self.receiver)
    }
}

/// Identification message answering a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdResponse {
    Accept,
    Reject,
}

impl IdResponse {
    const ACCEPT: &[u8] = b"ACCEPT";
    const REJECT: &[u8] = b"REJECT";

    #[must_use]
    pub fn encode(self) -> &'static [u8] {
        match self {
            IdResponse::Accept => Self::ACCEPT,
            IdResponse::Reject => Self::REJECT,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::MalformedIdResponse`] for anything but the exact
    /// `ACCEPT` or `REJECT` keywords.
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        match body {
            Self::ACCEPT => Ok(IdResponse::Accept),
            Self::REJECT => Ok(IdResponse::Reject),
            _ => Err(Error::MalformedIdResponse),
        }
    }

    #[must_use]
    pub fn is_accept(self) -> bool {
        self == IdResponse::Accept
    }
}

impl From<bool> for IdResponse {
    fn from(accept: bool) -> Self {
        if accept {
            IdResponse::Accept
        } else {
            IdResponse::Reject
        }
    }
}

/// Either kind of identification body, as queued by the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identification {
    Request(IdRequest),
    Response(IdResponse),
}

impl Identification {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Identification::Request(request) => request.encode(),
            Identification::Response(response) => response.encode().to_vec(),
        }
    }
}

/// Two byte code of a System message.
///
/// Unknown codes are kept so they can still be framed and forwarded, the
/// association does not act on them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SystemSignal {
    Shutdown,
    Startup,
    Heartbeat,
    Unknown([u8; 2]),
}

impl SystemSignal {
    #[must_use]
    pub fn code(self) -> [u8; 2] {
        match self {
            SystemSignal::Shutdown => *b"00",
            SystemSignal::Startup => *b"01",
            SystemSignal::Heartbeat => *b"03",
            SystemSignal::Unknown(code) => code,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::MalformedSystemSignal`] if the body is not 2 bytes.
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let code: [u8; 2] = body
            .try_into()
            .map_err(|_| Error::MalformedSystemSignal { len: body.len() })?;
        Ok(match &code {
            b"00" => SystemSignal::Shutdown,
            b"01" => SystemSignal::Startup,
            b"03" => SystemSignal::Heartbeat,
            _ => SystemSignal::Unknown(code),
        })
    }
}
