//! TLS ClientHello server name extraction
//!
//! Input comes straight off the network, so every length field is checked
//! against the remaining buffer before it is used.

use thiserror::Error;
use tracing::trace;

const HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_NAME_EXTENSION: u16 = 0x0000;
const HOST_NAME_TYPE: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Not a TLS ClientHello")]
    NotClientHello,

    #[error("Malformed ClientHello")]
    MalformedHello,

    #[error("ClientHello has no extensions")]
    NoExtensions,

    #[error("Server name is not a hostname")]
    NotHostname,

    #[error("ClientHello has no hostname")]
    NoHostname,
}

/// Bounds-checked cursor over untrusted bytes
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        let b = *self.data.get(self.pos).ok_or(SniError::MalformedHello)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if n > self.remaining() {
            return Err(SniError::MalformedHello);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }
}

/// True if `b` starts like a TLS handshake record carrying a ClientHello
pub fn looks_like_client_hello(b: &[u8]) -> bool {
    b.len() >= 6 && b[0] == HANDSHAKE_RECORD && b[1] == 0x03 && b[5] == CLIENT_HELLO
}

/// Declared length of the TLS record starting at `b`, header excluded
pub fn record_len(b: &[u8]) -> Option<usize> {
    if b.len() < RECORD_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([b[3], b[4]]) as usize)
}

/// Extract the SNI hostname from a TLS record holding a ClientHello
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    if !looks_like_client_hello(record) {
        return Err(SniError::NotClientHello);
    }

    let mut c = Cursor::new(record);
    c.skip(RECORD_HEADER_LEN)?;

    if c.u8()? != CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }
    // Handshake length (3), client version (2), random (32)
    c.skip(3 + 2 + 32)?;

    let session_id_len = c.u8()? as usize;
    c.skip(session_id_len)?;

    let cipher_suites_len = c.u16()? as usize;
    c.skip(cipher_suites_len)?;

    let compression_len = c.u8()? as usize;
    c.skip(compression_len)?;

    if c.remaining() == 0 {
        return Err(SniError::NoExtensions);
    }
    let extensions_len = c.u16()? as usize;
    let mut extensions = Cursor::new(c.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let body = extensions.take(ext_len)?;

        if ext_type == SERVER_NAME_EXTENSION {
            return parse_server_name(body);
        }
    }

    Err(SniError::NoHostname)
}

fn parse_server_name(body: &[u8]) -> Result<String, SniError> {
    let mut c = Cursor::new(body);
    // server_name_list length
    c.skip(2)?;

    if c.u8()? != HOST_NAME_TYPE {
        return Err(SniError::NotHostname);
    }
    let name_len = c.u16()? as usize;
    let name = c.take(name_len)?;

    let hostname = std::str::from_utf8(name).map_err(|_| SniError::MalformedHello)?;
    if hostname.is_empty() {
        return Err(SniError::NoHostname);
    }

    trace!("Extracted SNI hostname: {}", hostname);
    Ok(hostname.to_string())
}


#[cfg(test)]
mod tests {
    use super::testing::client_hello;
    use super::*;

    #[test]
    fn test_sni_extraction() {
        let hello = client_hello(Some("example.com"));
        assert!(looks_like_client_hello(&hello));
        assert_eq!(record_len(&hello), Some(hello.len() - 5));
        assert_eq!(extract_sni(&hello).unwrap(), "example.com");
    }

    #[test]
    fn test_sni_not_found() {
        let hello = client_hello(None);
        assert_eq!(extract_sni(&hello), Err(SniError::NoHostname));
    }

    #[test]
    fn test_not_a_client_hello() {
        assert_eq!(
            extract_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            Err(SniError::NotClientHello)
        );
        assert_eq!(extract_sni(&[0x16, 0x03]), Err(SniError::NotClientHello));
    }

    #[test]
    fn test_every_truncation_is_rejected_without_panic() {
        let hello = client_hello(Some("example.com"));
        for len in 6..hello.len() {
            let result = extract_sni(&hello[..len]);
            assert!(result.is_err(), "truncated to {} bytes parsed", len);
        }
    }

    #[test]
    fn test_garbage_lengths() {
        let mut hello = client_hello(Some("example.com"));
        // Claim a huge session id
        hello[5 + 4 + 2 + 32] = 0xff;
        assert_eq!(extract_sni(&hello), Err(SniError::MalformedHello));

        let mut hello = client_hello(Some("example.com"));
        // Claim oversized cipher suites
        hello[5 + 4 + 2 + 32 + 1] = 0xff;
        assert_eq!(extract_sni(&hello), Err(SniError::MalformedHello));
    }

    #[test]
    fn test_non_hostname_name_type() {
        let mut hello = client_hello(Some("example.com"));
        // The name type byte directly precedes the 11-byte name length
        let pos = hello
            .windows(3)
            .position(|w| w == [0x00, 0x00, 0x0b])
            .expect("hostname length marker");
        hello[pos] = 0x01;
        assert_eq!(extract_sni(&hello), Err(SniError::NotHostname));
    }
}
