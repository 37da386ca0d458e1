//! SSH payload encoding for forwarding messages
//!
//! Only the handful of RFC 4251 primitives the forwarding messages use:
//! `uint32`, `boolean` and `string`. Readers work on any [`Buf`], writers on
//! any [`BufMut`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const SSH_MSG_GLOBAL_REQUEST: u8 = 80;
pub const SSH_MSG_REQUEST_SUCCESS: u8 = 81;
pub const SSH_MSG_REQUEST_FAILURE: u8 = 82;
pub const SSH_MSG_CHANNEL_OPEN: u8 = 90;

/// Longest global request name accepted.
pub const MAX_NAME_LEN: usize = 64;
/// Longest host or address string accepted.
pub const MAX_HOST_LEN: usize = 256;

/// A forwarding payload did not decode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of payload")]
    UnexpectedEnd,

    #[error("string of {len} bytes exceeds limit of {max}")]
    TooLong { len: usize, max: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Decoding of SSH primitives.
pub trait SshBufExt: Buf {
    fn get_ssh_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(self.get_u32())
    }

    fn get_ssh_bool(&mut self) -> Result<bool> {
        if self.remaining() < 1 {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(self.get_u8() != 0)
    }

    /// Length-prefixed byte string. The whole string is consumed even when
    /// the caller later rejects it.
    fn get_ssh_string(&mut self) -> Result<Bytes> {
        let len = self.get_ssh_u32()? as usize;
        if self.remaining() < len {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(len))
    }

    /// String bounded by `max` bytes.
    fn get_ssh_string_max(&mut self, max: usize) -> Result<Bytes> {
        let s = self.get_ssh_string()?;
        if s.len() > max {
            return Err(WireError::TooLong { len: s.len(), max });
        }
        Ok(s)
    }

    /// UTF-8 text bounded by `max` bytes.
    fn get_ssh_text(&mut self, max: usize) -> Result<String> {
        let s = self.get_ssh_string_max(max)?;
        String::from_utf8(s.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

impl<B: Buf> SshBufExt for B {}

/// Encoding of SSH primitives.
pub trait SshBufMutExt: BufMut {
    fn put_ssh_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_ssh_string(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }
}

impl<B: BufMut> SshBufMutExt for B {}

/// Type-specific data of a `forwarded-tcpip` channel open.
pub fn encode_forwarded_tcpip(
    buf: &mut BytesMut,
    connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
) {
    buf.put_ssh_string(connected_address.as_bytes());
    buf.put_u32(connected_port);
    buf.put_ssh_string(originator_address.as_bytes());
    buf.put_u32(originator_port);
}
