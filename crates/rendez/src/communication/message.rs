// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload types carried by topics and services.

use crate::status::Status;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// A payload that can travel over a channel.
///
/// `schema_id` is compared at the Master: a subscriber whose schema differs
/// from the publisher's is refused with `SchemaMismatch`.
pub trait Message: Sized + Send + 'static {
    fn schema_id() -> String;

    fn encode(&self) -> Result<Vec<u8>, Status>;

    fn decode(bytes: &[u8]) -> Result<Self, Status>;
}

impl Message for Vec<u8> {
    fn schema_id() -> String {
        "bytes".into()
    }

    fn encode(&self) -> Result<Vec<u8>, Status> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self, Status> {
        Ok(bytes.to_vec())
    }
}

impl Message for String {
    fn schema_id() -> String {
        "string".into()
    }

    fn encode(&self) -> Result<Vec<u8>, Status> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, Status> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Status::invalid_argument(format!("payload is not UTF-8: {}", e)))
    }
}

/// JSON-encoded payload for any serde type.
///
/// The schema id is `json:` followed by the Rust type name.
///
/// ```
/// use rendez::communication::{Json, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Pose { x: f64, y: f64 }
///
/// let bytes = Json(Pose { x: 1.0, y: 2.0 }).encode().unwrap();
/// let Json(pose) = Json::<Pose>::decode(&bytes).unwrap();
/// assert_eq!(pose, Pose { x: 1.0, y: 2.0 });
/// ```
#[derive(Clone, PartialEq, Default)]
pub struct Json<T>(pub T);

impl<T: fmt::Debug> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T> Message for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn schema_id() -> String {
        format!("json:{}", std::any::type_name::<T>())
    }

    fn encode(&self) -> Result<Vec<u8>, Status> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, Status> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn test_schema_ids_differ() {
        assert_eq!(<Vec<u8>>::schema_id(), "bytes");
        assert_eq!(String::schema_id(), "string");
        assert_ne!(Json::<u32>::schema_id(), Json::<String>::schema_id());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let err = String::decode(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_json_decode_error() {
        assert!(Json::<Vec<u32>>::decode(b"{not json").is_err());
    }
}
