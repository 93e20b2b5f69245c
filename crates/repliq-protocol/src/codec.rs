//! Codecs: how packets become frame payloads and back.
//!
//! The protocol layer does not care how a [`Packet`](crate::Packet) is laid
//! out in bytes; it only needs something implementing [`Codec`]. Two
//! implementations ship behind Cargo features:
//!
//! - [`JsonCodec`] (`json`) is human-readable and handy when tracing
//!   traffic by eye;
//! - [`BinaryCodec`] (`binary`) is compact and is what nodes use unless
//!   told otherwise.
//!
//! Both ends of a connection must use the same codec; the
//! [`Packet::Hello`](crate::Packet::Hello) exchange fails to decode
//! otherwise and the connection is dropped.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because a codec is shared by every reader and
/// writer task of a node.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Fails when the bytes are malformed, truncated, or describe a
    /// different type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] using `serde_json`.
///
/// ```rust
/// use repliq_protocol::{Codec, JsonCodec, Packet};
///
/// let codec = JsonCodec;
/// let packet = Packet::Release { name: "alpha".into() };
///
/// let bytes = codec.encode(&packet).unwrap();
/// let decoded: Packet = codec.decode(&bytes).unwrap();
/// assert_eq!(packet, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ---------------------------------------------------------------------------
// BinaryCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] using `bincode`'s default (little-endian, fixed-int) layout.
#[cfg(feature = "binary")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

#[cfg(feature = "binary")]
impl Codec for BinaryCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Packet, Value};

    #[allow(dead_code)]
    fn sample() -> Packet {
        Packet::Invoke {
            name: "counter".into(),
            method: 2,
            args: vec![Value::Int(1), Value::from("x")],
            call_id: Some(7),
        }
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_decode_rejects_garbage() {
        let err = JsonCodec.decode::<Packet>(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[cfg(feature = "binary")]
    #[test]
    fn test_binary_decode_rejects_truncated_frame() {
        let bytes = BinaryCodec.encode(&sample()).unwrap();
        let err = BinaryCodec
            .decode::<Packet>(&bytes[..bytes.len() / 2])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Binary(_)));
    }

    #[cfg(all(feature = "json", feature = "binary"))]
    #[test]
    fn test_binary_is_smaller_than_json() {
        let packet = sample();
        let bin = BinaryCodec.encode(&packet).unwrap();
        let json = JsonCodec.encode(&packet).unwrap();
        assert!(bin.len() < json.len());
    }
}
