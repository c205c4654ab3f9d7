// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC frame body.
//!
//! Every RPC frame travels inside a length-prefixed stream frame:
//!
//! ```text
//! [u64 BE call id][u8 tag][body]
//!   tag 0: request,        body = encoded request
//!   tag 1: reply, success  body = encoded response
//!   tag 2: reply, failure  body = JSON status
//! ```

use crate::status::Status;

const HEADER_SIZE: usize = 9;

const TAG_REQUEST: u8 = 0;
const TAG_REPLY_OK: u8 = 1;
const TAG_REPLY_ERR: u8 = 2;

pub type CallId = u64;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RpcFrame {
    Request {
        id: CallId,
        payload: Vec<u8>,
    },
    Reply {
        id: CallId,
        result: Result<Vec<u8>, Status>,
    },
}

impl RpcFrame {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, Status> {
        let (id, tag, body) = match self {
            RpcFrame::Request { id, payload } => (*id, TAG_REQUEST, payload.clone()),
            RpcFrame::Reply { id, result: Ok(payload) } => (*id, TAG_REPLY_OK, payload.clone()),
            RpcFrame::Reply { id, result: Err(status) } => {
                (*id, TAG_REPLY_ERR, serde_json::to_vec(status)?)
            }
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&id.to_be_bytes());
        out.push(tag);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Status> {
        if bytes.len() < HEADER_SIZE {
            return Err(Status::transport_failure(format!(
                "rpc frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        let id = u64::from_be_bytes(id);
        let body = &bytes[HEADER_SIZE..];
        match bytes[8] {
            TAG_REQUEST => Ok(RpcFrame::Request {
                id,
                payload: body.to_vec(),
            }),
            TAG_REPLY_OK => Ok(RpcFrame::Reply {
                id,
                result: Ok(body.to_vec()),
            }),
            TAG_REPLY_ERR => {
                let status: Status = serde_json::from_slice(body)
                    .map_err(|e| Status::transport_failure(format!("bad rpc error body: {}", e)))?;
                Ok(RpcFrame::Reply {
                    id,
                    result: Err(status),
                })
            }
            tag => Err(Status::transport_failure(format!("unknown rpc frame tag {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn test_request_layout() {
        let bytes = RpcFrame::Request {
            id: 0x0102,
            payload: b"ping".to_vec(),
        }
        .encode()
        .unwrap();
        assert_eq!(&bytes[..9], &[0, 0, 0, 0, 0, 0, 1, 2, 0]);
        assert_eq!(&bytes[9..], b"ping");
    }

    #[test]
    fn test_error_reply_keeps_status() {
        let frame = RpcFrame::Reply {
            id: 9,
            result: Err(Status::timeout("slow")),
        };
        let decoded = RpcFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_rejects_short_and_unknown() {
        let err = RpcFrame::decode(&[0; 4]).unwrap_err();
        assert_eq!(err.code(), StatusCode::TransportFailure);

        let mut bytes = vec![0u8; 9];
        bytes[8] = 7;
        assert!(RpcFrame::decode(&bytes).is_err());
    }
}
