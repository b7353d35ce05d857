//! Page codec seam
//!
//! Every non-zero page passes through a [`PageCodec`] on its way to and from
//! the RAM file. A page is stored encoded iff its on-disk size is smaller than
//! the page size; otherwise the raw bytes are stored and decoding is skipped.
//!
//! Only the identity codec ships here. The codec id is recorded in the RAM
//! file index so a loader can refuse a file written with a codec it lacks.

/// Page codec trait
///
/// Codecs must be `Send + Sync`: the saver encodes on its writer thread and
/// the loader decodes on both the reader thread and the VM thread.
pub trait PageCodec: Send + Sync {
    /// Encode one page
    fn encode(&self, page: &[u8]) -> Vec<u8>;

    /// Decode one stored page back to `page_size` bytes
    fn decode(&self, data: &[u8], page_size: usize) -> Result<Vec<u8>, CodecError>;

    /// Identifier stored in the RAM file index
    fn codec_id(&self) -> &str;
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Stored bytes could not be decoded
    #[error("Decode error (codec={codec_id}, data_len={data_len}): {detail}")]
    DecodeError {
        /// What went wrong
        detail: String,
        /// Codec that attempted the decode
        codec_id: String,
        /// Length of the input
        data_len: usize,
    },

    /// RAM file names a codec this build does not have
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
}

impl CodecError {
    /// Create a decode error with diagnostic context
    pub fn decode(detail: impl Into<String>, codec_id: impl Into<String>, data_len: usize) -> Self {
        CodecError::DecodeError {
            detail: detail.into(),
            codec_id: codec_id.into(),
            data_len,
        }
    }
}

/// Pass-through codec
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl PageCodec for IdentityCodec {
    fn encode(&self, page: &[u8]) -> Vec<u8> {
        page.to_vec()
    }

    fn decode(&self, data: &[u8], page_size: usize) -> Result<Vec<u8>, CodecError> {
        if data.len() != page_size {
            return Err(CodecError::decode(
                format!("expected {page_size} bytes"),
                self.codec_id(),
                data.len(),
            ));
        }
        Ok(data.to_vec())
    }

    fn codec_id(&self) -> &str {
        "identity"
    }
}

/// Look up a codec by the id stored in a RAM file
pub fn get_codec(codec_id: &str) -> Result<Box<dyn PageCodec>, CodecError> {
    match codec_id {
        "identity" => Ok(Box::new(IdentityCodec)),
        other => Err(CodecError::UnknownCodec(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _accepts_box_dyn_codec(_codec: Box<dyn PageCodec>) {}

    #[test]
    fn test_identity_roundtrip() {
        let codec = get_codec("identity").unwrap();
        let page = vec![0xABu8; 4096];
        let encoded = codec.encode(&page);
        assert_eq!(encoded.len(), 4096);
        assert_eq!(codec.decode(&encoded, 4096).unwrap(), page);
    }

    #[test]
    fn test_identity_rejects_wrong_length() {
        let err = IdentityCodec.decode(&[1, 2, 3], 4096).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("identity"));
        assert!(msg.contains("data_len=3"));
    }

    #[test]
    fn test_unknown_codec() {
        let err = get_codec("lz4").err().unwrap();
        assert_eq!(err, CodecError::UnknownCodec("lz4".to_string()));
    }
}
