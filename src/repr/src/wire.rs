// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The binary wire encoding of [`DataRequest`].
//!
//! A record is a sequence of fields in fixed order:
//!
//! ```text
//! request id        16 bytes
//! endpoint          u32 length | UTF-8 bytes
//! headers           u16 count  | (key, value) length-prefixed string pairs
//! parameters        u64 length | bincode Value map
//! routes            u64 length | bincode route list
//! document batch    u64 length | bincode document list
//! ```
//!
//! All integers are big-endian. The document batch rides as an opaque
//! length-prefixed sub-record: components that only forward a request can
//! skip it without decoding. The same encoding is used on every surface that
//! carries requests in binary form — the internal `Data` service, Raft log
//! entries, and binary WebSocket frames.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::document::Document;
use crate::error::Error;
use crate::request::{DataRequest, ErrorStrategy, Headers, Route};
use crate::value::Value;
use crate::DocBatch;

const HEADER_EXEC_ENDPOINT: &str = "exec_endpoint";
const HEADER_TARGET_EXECUTOR: &str = "target_executor";
const HEADER_TRACING: &str = "tracing";
const HEADER_ON_ERROR: &str = "on_error";

/// Encodes a request into its binary record form.
pub fn encode(req: &DataRequest) -> Result<Bytes, Error> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(req.id.as_bytes());
    put_str(&mut buf, &req.endpoint);

    let mut headers: Vec<(&str, String)> =
        vec![(HEADER_EXEC_ENDPOINT, req.headers.exec_endpoint.clone())];
    if let Some(target) = &req.headers.target_executor {
        headers.push((HEADER_TARGET_EXECUTOR, target.clone()));
    }
    if let Some(tracing) = &req.headers.tracing {
        headers.push((HEADER_TRACING, tracing.clone()));
    }
    headers.push((
        HEADER_ON_ERROR,
        match req.headers.on_error {
            ErrorStrategy::ThrowEarly => "throw_early".into(),
            ErrorStrategy::SkipHandle => "skip_handle".into(),
            ErrorStrategy::SkipExecutor => "skip_executor".into(),
        },
    ));
    buf.put_u16(headers.len() as u16);
    for (key, value) in headers {
        put_str(&mut buf, key);
        put_str(&mut buf, &value);
    }

    put_blob(&mut buf, &bincode_encode(&req.parameters)?);
    put_blob(&mut buf, &bincode_encode(&req.routes)?);
    put_blob(&mut buf, &bincode_encode(&req.docs.0)?);
    Ok(buf.freeze())
}

/// Decodes a binary record back into a request.
pub fn decode(mut bytes: &[u8]) -> Result<DataRequest, Error> {
    let buf = &mut bytes;
    if buf.remaining() < 16 {
        return Err(malformed("truncated request id"));
    }
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    let endpoint = get_str(buf)?;

    if buf.remaining() < 2 {
        return Err(malformed("truncated header count"));
    }
    let mut headers = Headers::default();
    let header_count = buf.get_u16();
    for _ in 0..header_count {
        let key = get_str(buf)?;
        let value = get_str(buf)?;
        match key.as_str() {
            HEADER_EXEC_ENDPOINT => headers.exec_endpoint = value,
            HEADER_TARGET_EXECUTOR => headers.target_executor = Some(value),
            HEADER_TRACING => headers.tracing = Some(value),
            HEADER_ON_ERROR => {
                headers.on_error = match value.as_str() {
                    "skip_handle" => ErrorStrategy::SkipHandle,
                    "skip_executor" => ErrorStrategy::SkipExecutor,
                    _ => ErrorStrategy::ThrowEarly,
                }
            }
            // Unknown header keys are skipped for forward compatibility.
            _ => {}
        }
    }

    let parameters: BTreeMap<String, Value> = bincode_decode(&get_blob(buf)?)?;
    let routes: Vec<Route> = bincode_decode(&get_blob(buf)?)?;
    let docs: Vec<Document> = bincode_decode(&get_blob(buf)?)?;

    Ok(DataRequest {
        id: Uuid::from_bytes(id),
        endpoint,
        headers,
        parameters,
        routes,
        docs: DocBatch(docs),
    })
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String, Error> {
    if buf.remaining() < 4 {
        return Err(malformed("truncated string length"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(malformed("truncated string"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| malformed("string is not UTF-8"))?;
    buf.advance(len);
    Ok(s)
}

fn put_blob(buf: &mut BytesMut, blob: &[u8]) {
    buf.put_u64(blob.len() as u64);
    buf.put_slice(blob);
}

fn get_blob(buf: &mut &[u8]) -> Result<Vec<u8>, Error> {
    if buf.remaining() < 8 {
        return Err(malformed("truncated field length"));
    }
    let len = usize::try_from(buf.get_u64()).map_err(|_| malformed("oversized field"))?;
    if buf.remaining() < len {
        return Err(malformed("truncated field"));
    }
    let blob = buf[..len].to_vec();
    buf.advance(len);
    Ok(blob)
}

fn bincode_encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serialize(value).map_err(|e| malformed(format!("encode: {e}")))
}

fn bincode_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    bincode::deserialize(bytes).map_err(|e| malformed(format!("decode: {e}")))
}

fn malformed(message: impl std::fmt::Display) -> Error {
    Error::invalid_input("wire", format!("malformed record: {message}"))
}

#[cfg(test)]
mod tests {
    use crate::request::RouteStatus;

    use super::*;

    #[test]
    fn round_trips_a_full_request() {
        let mut req = DataRequest::new("/search", DocBatch(vec![Document::text("a", "hi")]));
        req.headers.target_executor = Some("enc.*".into());
        req.headers.on_error = ErrorStrategy::SkipHandle;
        req.parameters.insert("limit".into(), Value::Int(5));
        let i = req.begin_route("gateway");
        req.end_route(i, RouteStatus::Succeeded, None);

        let bytes = encode(&req).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn truncated_record_is_invalid_input() {
        let req = DataRequest::new("/foo", DocBatch::empty());
        let bytes = encode(&req).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::InvalidInput);
    }

    #[test]
    fn garbage_is_invalid_input() {
        assert!(decode(&[1, 2, 3]).is_err());
    }
}
