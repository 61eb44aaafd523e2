use std::fmt::Display;

use crate::{Error, FmtpType, MAX_BODY_LEN};

/// User data carried over an association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FmtpMessage {
    Operational(Vec<u8>),
    Operator(Vec<u8>),
}
impl FmtpMessage {
    /// # Errors
    ///
    /// Returns [`Error::BodyTooLarge`] above [`MAX_BODY_LEN`] bytes.
    pub fn operational(data: impl Into<Vec<u8>>) -> Result<Self, Error> {
        Ok(Self::Operational(checked(data.into())?))
    }

    /// # Errors
    ///
    /// Returns [`Error::BodyTooLarge`] above [`MAX_BODY_LEN`] bytes.
    pub fn operator(data: impl Into<Vec<u8>>) -> Result<Self, Error> {
        Ok(Self::Operator(checked(data.into())?))
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            FmtpMessage::Operator(data) | FmtpMessage::Operational(data) => data,
        }
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        match self {
            FmtpMessage::Operator(data) | FmtpMessage::Operational(data) => data,
        }
    }

    #[must_use]
    pub fn typ(&self) -> FmtpType {
        match self {
            FmtpMessage::Operational(_) => FmtpType::Operational,
            FmtpMessage::Operator(_) => FmtpType::Operator,
        }
    }
}

fn checked(data: Vec<u8>) -> Result<Vec<u8>, Error> {
    if data.len() > MAX_BODY_LEN {
        return Err(Error::BodyTooLarge {
            size: data.len(),
            max: MAX_BODY_LEN,
        });
    }
    Ok(data)
}

impl Display for FmtpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: {}",
            self.typ(),
            String::from_utf8_lossy(self.data())
        )
    }
}
