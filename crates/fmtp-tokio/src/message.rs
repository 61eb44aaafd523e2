use std::fmt::Debug;

use fmtp_core::{Error, FmtpMessage, FmtpPacket, FmtpType, MAX_BODY_LEN};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Body of an outbound [`Message`].
pub enum Body {
    /// A body held in memory.
    Bytes(Vec<u8>),
    /// A body streamed from a reader. Without a length hint the reader is
    /// buffered to learn its size, at most [`MAX_BODY_LEN`] + 1 bytes.
    Reader {
        /// Source of the body bytes
        reader: Box<dyn AsyncRead + Send + Unpin>,
        /// Announced length, see [`Message::with_len`]
        len: Option<usize>,
    },
}

impl Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Reader { len, .. } => f.debug_struct("Reader").field("len", len).finish(),
        }
    }
}

/// An outbound user message whose body length may not be known up front.
#[derive(Debug)]
pub struct Message {
    typ: FmtpType,
    body: Body,
}

impl Message {
    /// # Errors
    ///
    /// Returns [`Error::NotUserData`] for Identification and System types.
    pub fn new(typ: FmtpType, body: Body) -> Result<Self, Error> {
        match typ {
            FmtpType::Operational | FmtpType::Operator => Ok(Self { typ, body }),
            FmtpType::Identification | FmtpType::System => Err(Error::NotUserData(typ)),
        }
    }

    /// An Operational message. Oversized bodies fail when sent.
    #[must_use]
    pub fn operational(data: impl Into<Vec<u8>>) -> Self {
        Self {
            typ: FmtpType::Operational,
            body: Body::Bytes(data.into()),
        }
    }

    /// An Operator message. Oversized bodies fail when sent.
    #[must_use]
    pub fn operator(data: impl Into<Vec<u8>>) -> Self {
        Self {
            typ: FmtpType::Operator,
            body: Body::Bytes(data.into()),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::NotUserData`] for Identification and System types.
    pub fn from_reader(
        typ: FmtpType,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Self, Error> {
        Self::new(
            typ,
            Body::Reader {
                reader: Box::new(reader),
                len: None,
            },
        )
    }

    /// Announces the length of a reader body so it is not buffered.
    #[must_use]
    pub fn with_len(mut self, hint: usize) -> Self {
        if let Body::Reader { len, .. } = &mut self.body {
            *len = Some(hint);
        }
        self
    }

    #[must_use]
    pub fn typ(&self) -> FmtpType {
        self.typ
    }

    /// Materializes the frame.
    ///
    /// # Errors
    ///
    /// [`Error::BodyTooLarge`] if the body does not fit a frame, checked
    /// before anything is written. [`Error::TruncatedBody`] if a reader ends
    /// before its announced length.
    pub async fn into_packet(self) -> Result<FmtpPacket, Error> {
        let data = match self.body {
            Body::Bytes(bytes) => bytes,
            Body::Reader {
                reader,
                len: Some(len),
            } => {
                if len > MAX_BODY_LEN {
                    return Err(Error::BodyTooLarge {
                        size: len,
                        max: MAX_BODY_LEN,
                    });
                }
                let mut data = Vec::with_capacity(len);
                reader.take(len as u64).read_to_end(&mut data).await?;
                if data.len() < len {
                    return Err(Error::TruncatedBody {
                        expected: len,
                        got: data.len(),
                    });
                }
                data
            }
            Body::Reader { reader, len: None } => {
                let mut data = Vec::new();
                reader
                    .take(MAX_BODY_LEN as u64 + 1)
                    .read_to_end(&mut data)
                    .await?;
                data
            }
        };
        FmtpPacket::new(self.typ, data)
    }

    /// Writes the message as one frame and returns the bytes written.
    ///
    /// # Errors
    ///
    /// See [`Message::into_packet`], plus I/O errors of `writer`.
    pub async fn write_to<W>(self, writer: &mut W) -> Result<usize, Error>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.into_packet().await?.into_bytes();
        writer.write_all(&bytes).await?;
        Ok(bytes.len())
    }
}

impl From<FmtpMessage> for Message {
    fn from(msg: FmtpMessage) -> Self {
        Self {
            typ: msg.typ(),
            body: Body::Bytes(msg.into_data()),
        }
    }
}
