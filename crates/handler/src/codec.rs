//! Envelope codecs for the HTTP body carriers.
//!
//! Real deployments terminate Binary HTTP and Oblivious HTTP outside the
//! core and plug implementations of these traits in; the in-tree variants
//! carry the same contract for local runs and tests.

use silo_common::Error;
use silo_lookup::sealing::{Envelope, KeyFetcherManager};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Binary HTTP
// ---------------------------------------------------------------------------

/// Frames an inner request/response body in a Binary-HTTP-style envelope.
pub trait BhttpCodec: Send + Sync {
    /// Extract the inner body from an encoded request.
    fn decode_request(&self, body: &[u8]) -> Result<Vec<u8>, Error>;

    /// Encode a response with the given status code.
    fn encode_response(&self, status: u16, body: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Local variant: `<head>\r\n\r\n<body>` on requests, `<status>\r\n\r\n<body>`
/// on responses.
pub struct LineDelimitedBhttp;

const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";

fn find_delimiter(body: &[u8]) -> Option<usize> {
    body.windows(HEAD_DELIMITER.len())
        .position(|window| window == HEAD_DELIMITER)
}

impl BhttpCodec for LineDelimitedBhttp {
    fn decode_request(&self, body: &[u8]) -> Result<Vec<u8>, Error> {
        match find_delimiter(body) {
            Some(at) => Ok(body[at + HEAD_DELIMITER.len()..].to_vec()),
            None => Err(Error::InvalidArgument(
                "binary http request has no head delimiter".into(),
            )),
        }
    }

    fn encode_response(&self, status: u16, body: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = format!("{status}\r\n\r\n").into_bytes();
        out.extend_from_slice(body);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Oblivious HTTP
// ---------------------------------------------------------------------------

/// Decapsulates/encapsulates the oblivious carrier around a Binary HTTP
/// payload.
pub trait OhttpCodec: Send + Sync {
    /// Open an encapsulated request; returns the key id it was sealed under
    /// and the inner Binary HTTP payload.
    fn open_request(&self, body: &[u8]) -> Result<(String, Vec<u8>), Error>;

    /// Seal a response to the caller under the request's key id.
    fn seal_response(&self, key_id: &str, body: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Local variant: `[key_id_len u8][key_id][sealed payload]`, sealed by the
/// key fetcher's sealer for that id.
pub struct SealedOhttp {
    key_fetcher: Arc<dyn KeyFetcherManager>,
}

impl SealedOhttp {
    pub fn new(key_fetcher: Arc<dyn KeyFetcherManager>) -> Self {
        Self { key_fetcher }
    }

    /// Client-side helper: encapsulate a request under `key_id`.
    pub fn seal_request(&self, key_id: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        let key_id_bytes = key_id.as_bytes();
        if key_id_bytes.len() > u8::MAX as usize {
            return Err(Error::InvalidArgument("key id too long".into()));
        }
        let ciphertext = self.key_fetcher.sealer(key_id)?.seal(body)?;
        let mut out = Vec::with_capacity(1 + key_id_bytes.len() + ciphertext.len());
        out.push(key_id_bytes.len() as u8);
        out.extend_from_slice(key_id_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Client-side helper: open a sealed response.
    pub fn open_response(&self, key_id: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        self.key_fetcher.sealer(key_id)?.open(body)
    }
}

impl OhttpCodec for SealedOhttp {
    fn open_request(&self, body: &[u8]) -> Result<(String, Vec<u8>), Error> {
        let (&key_id_len, rest) = body
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("empty oblivious request".into()))?;
        let key_id_len = key_id_len as usize;
        if rest.len() < key_id_len {
            return Err(Error::InvalidArgument(
                "truncated oblivious request key id".into(),
            ));
        }
        let (key_id_bytes, ciphertext) = rest.split_at(key_id_len);
        let key_id = std::str::from_utf8(key_id_bytes)
            .map_err(|_| Error::InvalidArgument("key id is not UTF-8".into()))?
            .to_string();

        let envelope = Envelope {
            key_id: key_id.clone(),
            ciphertext: ciphertext.to_vec(),
        };
        let plaintext = silo_lookup::sealing::open_with(self.key_fetcher.as_ref(), &envelope)?;
        Ok((key_id, plaintext))
    }

    fn seal_response(&self, key_id: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        self.key_fetcher.sealer(key_id)?.seal(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_lookup::sealing::LocalKeyFetcher;

    #[test]
    fn test_bhttp_decode_request() {
        let codec = LineDelimitedBhttp;
        let body = b"POST / HTTP/1.1\r\ncontent-type: application/json\r\n\r\n{\"a\":1}";
        assert_eq!(codec.decode_request(body).unwrap(), b"{\"a\":1}");
        assert!(codec.decode_request(b"no delimiter").is_err());
    }

    #[test]
    fn test_bhttp_encode_response() {
        let codec = LineDelimitedBhttp;
        assert_eq!(codec.encode_response(200, b"ok").unwrap(), b"200\r\n\r\nok");
        assert_eq!(codec.encode_response(500, b"").unwrap(), b"500\r\n\r\n");
    }

    #[test]
    fn test_ohttp_round_trip() {
        let fetcher = Arc::new(LocalKeyFetcher::new("key-9", "seed"));
        let codec = SealedOhttp::new(fetcher);

        let sealed = codec.seal_request("key-9", b"inner payload").unwrap();
        let (key_id, opened) = codec.open_request(&sealed).unwrap();
        assert_eq!(key_id, "key-9");
        assert_eq!(opened, b"inner payload");

        let response = codec.seal_response(&key_id, b"response payload").unwrap();
        assert_eq!(
            codec.open_response(&key_id, &response).unwrap(),
            b"response payload"
        );
    }

    #[test]
    fn test_ohttp_rejects_malformed() {
        let fetcher = Arc::new(LocalKeyFetcher::new("key-9", "seed"));
        let codec = SealedOhttp::new(fetcher);
        assert!(codec.open_request(&[]).is_err());
        assert!(codec.open_request(&[200, b'x']).is_err());
    }
}
