use std::{fmt::Display, ops::Deref, str::FromStr};

use crate::Error;

/// Maximum length of an FMTP identification value.
pub const MAX_ID_LEN: usize = 32;

/// Identification value of an FMTP endpoint.
///
/// 1 to 32 printable ASCII bytes. The hyphen is reserved as separator of
/// the identification request and therefore rejected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FmtpIdentifier(Vec<u8>);

impl FmtpIdentifier {
    /// Validates and wraps an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] if the value is empty, longer than
    /// [`MAX_ID_LEN`], or contains anything but printable ASCII except `-`.
    pub fn new(id: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(Error::InvalidIdentifier(
                "FMTP identifier must be 0<n<=32 bytes long",
            ));
        }
        if !id.iter().all(u8::is_ascii_graphic) {
            return Err(Error::InvalidIdentifier(
                "FMTP identifier must only contain printable ASCII characters",
            ));
        }
        if id.contains(&b'-') {
            return Err(Error::InvalidIdentifier(
                "FMTP identifier must not contain a hyphen",
            ));
        }
        Ok(Self(id))
    }
}

impl Deref for FmtpIdentifier {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for FmtpIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // validated ASCII
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl FromStr for FmtpIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
