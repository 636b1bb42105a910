use crate::codec::{Decoder, Encoder, sealed};
use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON codec for any serde type.
///
/// The default codec for flow state: frames stay human-readable in storage,
/// which makes corrupted or stuck flows easy to inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {}
impl Decoder for JsonCodec {}

impl<T: Serialize> sealed::EncodeValue<T> for JsonCodec {
    fn encode_value(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl<T: DeserializeOwned> sealed::DecodeValue<T> for JsonCodec {
    fn decode_value(&self, bytes: Bytes) -> Result<T> {
        Ok(serde_json::from_slice(&bytes)?)
    }
}
