//! Length-prefixed message framing.
//!
//! Each frame is an 8-byte big-endian payload length followed by exactly that
//! many bytes of an encoded message. The stream ends with EOF on a frame
//! boundary.

use prost::Message;
use std::io::{ErrorKind as IoErrorKind, Read};

use crate::error::{Error, Result};

const SIZE_PREFIX_LEN: usize = 8;

pub struct CrashStreamReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> CrashStreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads the next frame and decodes it.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A short prefix or payload
    /// is [`Error::Unavailable`]; a payload that does not decode is
    /// [`Error::Corrupt`].
    pub fn read_message<M: Message + Default>(&mut self) -> Result<Option<M>> {
        let Some(size) = self.read_size()? else {
            return Ok(None);
        };

        self.buffer.clear();
        let read = (&mut self.reader)
            .take(size)
            .read_to_end(&mut self.buffer)
            .map_err(|e| Error::Unavailable(format!("failed to read complete proto: {}", e)))?;
        if (read as u64) < size {
            return Err(Error::Unavailable(format!(
                "failed to read complete proto. Read {} bytes but wanted {}",
                read, size
            )));
        }

        M::decode(self.buffer.as_slice())
            .map(Some)
            .map_err(|e| Error::Corrupt(format!("failed to unmarshal proto: {}", e)))
    }

    fn read_size(&mut self) -> Result<Option<u64>> {
        let mut size_bytes = [0u8; SIZE_PREFIX_LEN];
        let mut filled = 0;

        while filled < SIZE_PREFIX_LEN {
            match self.reader.read(&mut size_bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Unavailable(format!("failed to read a size: {}", e)));
                }
            }
        }

        match filled {
            0 => Ok(None),
            SIZE_PREFIX_LEN => Ok(Some(u64::from_be_bytes(size_bytes))),
            partial => Err(Error::Unavailable(format!(
                "failed to read a size: got {} of {} bytes",
                partial, SIZE_PREFIX_LEN
            ))),
        }
    }
}

/// Frames `message` the way the serializer does.
pub fn encode_frame<M: Message>(message: &M) -> Vec<u8> {
    let payload = message.encode_to_vec();
    let mut frame = Vec::with_capacity(SIZE_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}
