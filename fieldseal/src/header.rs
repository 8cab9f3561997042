//! Ciphertext envelope format for encrypted field values.
//!
//! The header carries what is needed to decrypt a value in isolation:
//! - Protocol version
//! - Flags (deterministic or randomized)
//! - DEK identifier
//! - Declared field type
//! - Nonce (empty for deterministic values)

use crate::error::Error;
use crate::schema::FieldType;
use uuid::Uuid;

/// Protocol version for the envelope format.
pub const PROTOCOL_VERSION: u8 = 1;

const KEY_ID_LEN: usize = 16;

/// Header flags for encryption options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// Creates empty flags (randomized mode).
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Checks if deterministic mode is enabled.
    #[must_use]
    pub const fn is_deterministic(self) -> bool {
        (self.0 & 0x01) != 0
    }

    /// Sets deterministic mode flag.
    #[must_use]
    pub const fn with_deterministic(mut self) -> Self {
        self.0 |= 0x01;
        self
    }

    /// Returns the raw flags value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Creates flags from a raw value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Envelope header preceding every field ciphertext.
///
/// Format:
/// ```text
/// [version:1][flags:1][key_id:16][value_type:1][nonce_len:1][nonce:N]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    version: u8,
    flags: HeaderFlags,
    key_id: Uuid,
    value_type: FieldType,
    nonce: Vec<u8>,
}

impl EncryptionHeader {
    /// Creates a new header.
    ///
    /// # Arguments
    ///
    /// * `flags` - Encryption flags
    /// * `key_id` - Identifier of the DEK that encrypted the payload
    /// * `value_type` - Declared type of the plaintext
    /// * `nonce` - Random nonce, empty in deterministic mode
    #[must_use]
    pub const fn new(flags: HeaderFlags, key_id: Uuid, value_type: FieldType, nonce: Vec<u8>) -> Self {
        Self { version: PROTOCOL_VERSION, flags, key_id, value_type, nonce }
    }

    /// Returns the protocol version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the header flags.
    #[must_use]
    pub const fn flags(&self) -> HeaderFlags {
        self.flags
    }

    /// Returns the DEK identifier.
    #[must_use]
    pub const fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Returns the declared plaintext type.
    #[must_use]
    pub const fn value_type(&self) -> FieldType {
        self.value_type
    }

    /// Returns the nonce.
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Serializes the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the nonce is longer than 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.nonce.len() > 255 {
            return Err(Error::InvalidHeader(format!(
                "Nonce too long: {} bytes (max: 255)",
                self.nonce.len()
            )));
        }

        let mut bytes = Vec::with_capacity(4 + KEY_ID_LEN + self.nonce.len());
        bytes.push(self.version);
        bytes.push(self.flags.as_u8());
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.push(self.value_type.as_u8());

        // Safe cast: length validated above, max 255
        #[allow(clippy::cast_possible_truncation)]
        let nonce_len = self.nonce.len() as u8;
        bytes.push(nonce_len);
        bytes.extend_from_slice(&self.nonce);

        Ok(bytes)
    }

    /// Deserializes a header from the front of `data`, returning it with the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The data is too short
    /// - The version is not supported
    /// - The value type is unknown
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Error> {
        let (&version, rest) =
            data.split_first().ok_or_else(|| Error::InvalidHeader("Empty header data".into()))?;

        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion {
                version,
                supported: PROTOCOL_VERSION.to_string(),
            });
        }

        let (&flags, rest) =
            rest.split_first().ok_or_else(|| Error::InvalidHeader("Missing flags".into()))?;

        if rest.len() < KEY_ID_LEN {
            return Err(Error::InvalidHeader("Key id truncated".into()));
        }
        let (key_id, rest) = rest.split_at(KEY_ID_LEN);
        let key_id = Uuid::from_slice(key_id)
            .map_err(|e| Error::InvalidHeader(format!("Invalid key id: {e}")))?;

        let (&value_type, rest) =
            rest.split_first().ok_or_else(|| Error::InvalidHeader("Missing value type".into()))?;
        let value_type = FieldType::from_u8(value_type)
            .ok_or_else(|| Error::InvalidHeader(format!("Unknown value type: {value_type}")))?;

        let (&nonce_len, rest) =
            rest.split_first().ok_or_else(|| Error::InvalidHeader("Missing nonce length".into()))?;
        let nonce_len = nonce_len as usize;
        if rest.len() < nonce_len {
            return Err(Error::InvalidHeader("Nonce truncated".into()));
        }
        let nonce = rest[..nonce_len].to_vec();

        let consumed = 4 + KEY_ID_LEN + nonce_len;
        let header =
            Self { version, flags: HeaderFlags::from_u8(flags), key_id, value_type, nonce };

        Ok((header, consumed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags() {
        let flags = HeaderFlags::empty();
        assert!(!flags.is_deterministic());
        assert_eq!(flags.as_u8(), 0);

        let flags = flags.with_deterministic();
        assert!(flags.is_deterministic());
        assert_eq!(flags.as_u8(), 1);
    }

    #[test]
    fn test_header_serialization() {
        let key_id = Uuid::new_v4();
        let header = EncryptionHeader::new(
            HeaderFlags::empty(),
            key_id,
            FieldType::String,
            vec![5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
        );

        let bytes = header.to_bytes().expect("Failed to serialize header");
        let (parsed, pos) = EncryptionHeader::from_bytes(&bytes).expect("Failed to parse header");

        assert_eq!(parsed, header);
        assert_eq!(pos, bytes.len());
        assert_eq!(parsed.key_id(), key_id);
    }

    #[test]
    fn test_header_deterministic_has_no_nonce() {
        let header = EncryptionHeader::new(
            HeaderFlags::empty().with_deterministic(),
            Uuid::new_v4(),
            FieldType::Long,
            Vec::new(),
        );

        let mut bytes = header.to_bytes().unwrap();
        bytes.extend_from_slice(b"payload");
        let (parsed, pos) = EncryptionHeader::from_bytes(&bytes).unwrap();

        assert!(parsed.flags().is_deterministic());
        assert!(parsed.nonce().is_empty());
        assert_eq!(parsed.value_type(), FieldType::Long);
        assert_eq!(&bytes[pos..], b"payload");
    }

    #[test]
    fn test_header_unsupported_version() {
        let mut bytes = vec![99, 0];
        bytes.extend_from_slice(&[0; KEY_ID_LEN]);
        bytes.push(FieldType::String.as_u8());
        bytes.push(0);

        let result = EncryptionHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::UnsupportedVersion { version: 99, .. })));
    }

    #[test]
    fn test_header_truncated_data() {
        let bytes = vec![PROTOCOL_VERSION, 0, 1, 2, 3];
        let result = EncryptionHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_header_truncated_nonce() {
        let header =
            EncryptionHeader::new(HeaderFlags::empty(), Uuid::new_v4(), FieldType::String, vec![1; 12]);
        let bytes = header.to_bytes().unwrap();

        let result = EncryptionHeader::from_bytes(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_header_unknown_value_type() {
        let mut bytes = vec![PROTOCOL_VERSION, 0];
        bytes.extend_from_slice(&[0; KEY_ID_LEN]);
        bytes.push(0xEE);
        bytes.push(0);

        let result = EncryptionHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_header_empty_data() {
        let result = EncryptionHeader::from_bytes(&[]);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_header_nonce_too_long() {
        let header =
            EncryptionHeader::new(HeaderFlags::empty(), Uuid::new_v4(), FieldType::String, vec![0; 256]);
        assert!(matches!(header.to_bytes(), Err(Error::InvalidHeader(_))));
    }
}
