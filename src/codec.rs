// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! Pluggable marshal/unmarshal pair for message bodies. Codecs are passed
//! explicitly to whatever builds or reads messages; [`json`] is only a
//! convenience for the common default.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes message bodies.
pub trait Codec: Send + Sync {
    /// MIME type stamped on messages encoded by this codec.
    fn content_type(&self) -> &'static str;

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError>;

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, AmqpError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializationError(err.to_string())
        })
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }
}

/// The default codec.
pub fn json() -> JsonCodec {
    JsonCodec
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        name: String,
        attempts: u8,
    }

    #[test]
    fn json_round_trips_a_struct() {
        let codec = json();
        let job = Job {
            name: "resize".to_owned(),
            attempts: 2,
        };

        let bytes = codec.marshal(&job).unwrap();
        assert_eq!(codec.unmarshal::<Job>(&bytes).unwrap(), job);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = json().unmarshal::<Job>(b"not json").unwrap_err();
        assert!(matches!(err, AmqpError::ParsePayloadError(_)));
    }
}
