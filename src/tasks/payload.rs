//! Opaque typed payloads.
//!
//! Controller and agents do not share a type system: only a type name and a
//! JSON document cross the wire. `PayloadRegistry` turns those back into a
//! consumer-defined type, and an unregistered name is a configuration error.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::BusMessage;
use crate::error::{Classify, ErrorClass};

/// Errors decoding an opaque payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("No decoder registered for payload type '{0}'")]
    UnknownType(String),

    #[error("Expected payload type '{expected}', got '{actual}'")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("Malformed '{type_name}' payload: {source}")]
    Serialization {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Classify for PayloadError {
    fn class(&self) -> ErrorClass {
        match self {
            PayloadError::UnknownType(_) | PayloadError::TypeMismatch { .. } => {
                ErrorClass::Configuration
            }
            PayloadError::Serialization { .. } => ErrorClass::Validation,
        }
    }
}

/// A type tag plus the serialized data it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedPayload {
    pub type_name: String,
    pub data: serde_json::Value,
}

impl TypedPayload {
    pub fn new(type_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    pub fn encode<M: BusMessage>(message: &M) -> Result<Self, PayloadError> {
        let data = serde_json::to_value(message).map_err(|source| PayloadError::Serialization {
            type_name: M::MESSAGE_TYPE.to_string(),
            source,
        })?;
        Ok(Self::new(M::MESSAGE_TYPE, data))
    }

    pub fn is<M: BusMessage>(&self) -> bool {
        self.type_name == M::MESSAGE_TYPE
    }

    pub fn decode<M: BusMessage>(&self) -> Result<M, PayloadError> {
        if !self.is::<M>() {
            return Err(PayloadError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                actual: self.type_name.clone(),
            });
        }
        M::deserialize(&self.data).map_err(|source| PayloadError::Serialization {
            type_name: self.type_name.clone(),
            source,
        })
    }
}

impl fmt::Display for TypedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name)
    }
}

type Decoder<T> = Box<dyn Fn(&serde_json::Value) -> Result<T, serde_json::Error> + Send + Sync>;

/// Explicit type name to decoder mapping producing a tagged variant `T`.
pub struct PayloadRegistry<T> {
    decoders: HashMap<&'static str, Decoder<T>>,
}

impl<T> Default for PayloadRegistry<T> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<T: 'static> PayloadRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M`, wrapping decoded values with `wrap`.
    pub fn register<M: BusMessage>(mut self, wrap: fn(M) -> T) -> Self {
        self.decoders.insert(
            M::MESSAGE_TYPE,
            Box::new(move |data| M::deserialize(data).map(wrap)),
        );
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn decode(&self, payload: &TypedPayload) -> Result<T, PayloadError> {
        let decoder = self
            .decoders
            .get(payload.type_name.as_str())
            .ok_or_else(|| PayloadError::UnknownType(payload.type_name.clone()))?;
        decoder(&payload.data).map_err(|source| PayloadError::Serialization {
            type_name: payload.type_name.clone(),
            source,
        })
    }
}
