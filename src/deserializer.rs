//! Pluggable record decoding.
//!
//! The consumer core hands raw bytes to a [`Deserializer`] at the stream
//! edge. A failing deserializer surfaces as an inline error on the
//! partition stream; it never tears the stream or the consumer down.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;

/// Boxed error returned by deserializers.
pub type DeserializeError = Box<dyn std::error::Error + Send + Sync>;

/// Decodes one half (key or value) of a Kafka record.
///
/// `payload` is `None` for records without a key or with a null value.
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, topic: &str, payload: Option<&[u8]>) -> Result<T, DeserializeError>;
}

/// Closures can act as deserializers, which keeps test setups short.
impl<T, F> Deserializer<T> for F
where
    F: Fn(&str, Option<&[u8]>) -> Result<T, DeserializeError> + Send + Sync,
{
    fn deserialize(&self, topic: &str, payload: Option<&[u8]>) -> Result<T, DeserializeError> {
        self(topic, payload)
    }
}

/// Passes the raw bytes through; absent payloads become empty buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDeserializer;

impl Deserializer<Bytes> for BytesDeserializer {
    fn deserialize(&self, _topic: &str, payload: Option<&[u8]>) -> Result<Bytes, DeserializeError> {
        Ok(payload.map(Bytes::copy_from_slice).unwrap_or_default())
    }
}

/// Decodes UTF-8 text; absent payloads become empty strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDeserializer;

impl Deserializer<String> for StringDeserializer {
    fn deserialize(&self, _topic: &str, payload: Option<&[u8]>) -> Result<String, DeserializeError> {
        match payload {
            Some(bytes) => Ok(std::str::from_utf8(bytes)?.to_string()),
            None => Ok(String::new()),
        }
    }
}

/// Decodes a JSON payload into any `serde`-deserializable type.
#[derive(Debug, Clone, Copy)]
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> JsonDeserializer<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> Deserializer<T> for JsonDeserializer<T>
where
    T: DeserializeOwned + Send + Sync,
{
    fn deserialize(&self, _topic: &str, payload: Option<&[u8]>) -> Result<T, DeserializeError> {
        let bytes = payload.ok_or("cannot decode JSON from an absent payload")?;
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_passthrough() {
        let decoded = BytesDeserializer.deserialize("t", Some(b"abc")).unwrap();
        assert_eq!(decoded.as_ref(), b"abc");
        let empty = BytesDeserializer.deserialize("t", None).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        assert!(StringDeserializer.deserialize("t", Some(&[0xff, 0xfe])).is_err());
        assert_eq!(
            StringDeserializer.deserialize("t", Some(b"hello")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_json_round_trip() {
        #[derive(serde::Deserialize)]
        struct Payload {
            id: u64,
        }
        let decoder = JsonDeserializer::<Payload>::new();
        let decoded = decoder.deserialize("t", Some(br#"{"id":7}"#)).unwrap();
        assert_eq!(decoded.id, 7);
        assert!(decoder.deserialize("t", None).is_err());
    }

    #[test]
    fn test_closure_deserializer() {
        let decoder = |_topic: &str, payload: Option<&[u8]>| -> Result<usize, DeserializeError> {
            Ok(payload.map(<[u8]>::len).unwrap_or(0))
        };
        assert_eq!(decoder.deserialize("t", Some(b"1234")).unwrap(), 4);
    }
}
