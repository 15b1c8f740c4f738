//! # Wire Protocol
//!
//! Purpose: Define the request/reply vocabulary shared by the client and the
//! backend, and the framing used to carry it over a byte stream.
//!
//! ## Design Principles
//!
//! 1. **Multiplexed**: Every frame carries the caller-chosen request id, so
//!    many requests can be in flight on one connection and replies may
//!    arrive in any order.
//! 2. **Length-Prefixed**: A frame is a big-endian `u32` body length followed
//!    by a JSON envelope. The decoder never consumes a partial frame.
//! 3. **Typed Errors**: Backend conditions travel as `AppError` inside a
//!    successful frame; only framing failures are protocol errors.
//!
//! ## Frame Layout
//!
//! ```text
//! +-----------+-------------------------------------------+
//! | len: u32  | body: {"id": 7, "body": {...}}  (len bytes) |
//! +-----------+-------------------------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;
use crate::types::{BatchMutation, Mutation, WireRow};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Framing and envelope errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Request id plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: u64, body: T) -> Self {
        Envelope { id, body }
    }
}

/// Server-side scanner parameters.
///
/// `start_row` is inclusive. `stop_row` is exclusive. With `reversed` the
/// scanner starts at `start_row` and walks towards smaller keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSpec {
    #[serde(default)]
    pub start_row: Option<String>,
    #[serde(default)]
    pub stop_row: Option<String>,
    /// Column restriction; entries are families or `family:qualifier`.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub reversed: bool,
    /// Rows the backend may buffer per fetch.
    #[serde(default)]
    pub caching: u32,
}

/// Operations understood by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    GetTableNames,
    CreateTable {
        table: String,
        families: Vec<String>,
    },
    EnableTable {
        table: String,
    },
    DisableTable {
        table: String,
    },
    DeleteTable {
        table: String,
    },
    GetRow {
        table: String,
        row: String,
        #[serde(default)]
        columns: Vec<String>,
    },
    GetRows {
        table: String,
        rows: Vec<String>,
        #[serde(default)]
        columns: Vec<String>,
    },
    MutateRow {
        table: String,
        row: String,
        mutations: Vec<Mutation>,
    },
    MutateRows {
        table: String,
        batches: Vec<BatchMutation>,
    },
    /// Deletes a single column of a row.
    DeleteAll {
        table: String,
        row: String,
        column: String,
    },
    /// Deletes a whole row.
    DeleteAllRow {
        table: String,
        row: String,
    },
    Increment {
        table: String,
        row: String,
        column: String,
        amount: i64,
    },
    ScannerOpen {
        table: String,
        scan: ScanSpec,
    },
    ScannerGetList {
        id: u64,
        count: u32,
    },
    ScannerClose {
        id: u64,
    },
}

impl Request {
    /// Operation name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetTableNames => "get_table_names",
            Request::CreateTable { .. } => "create_table",
            Request::EnableTable { .. } => "enable_table",
            Request::DisableTable { .. } => "disable_table",
            Request::DeleteTable { .. } => "delete_table",
            Request::GetRow { .. } => "get_row",
            Request::GetRows { .. } => "get_rows",
            Request::MutateRow { .. } => "mutate_row",
            Request::MutateRows { .. } => "mutate_rows",
            Request::DeleteAll { .. } => "delete_all",
            Request::DeleteAllRow { .. } => "delete_all_row",
            Request::Increment { .. } => "increment",
            Request::ScannerOpen { .. } => "scanner_open",
            Request::ScannerGetList { .. } => "scanner_get_list",
            Request::ScannerClose { .. } => "scanner_close",
        }
    }

    /// Target table, if the operation has one.
    pub fn table(&self) -> Option<&str> {
        match self {
            Request::CreateTable { table, .. }
            | Request::EnableTable { table }
            | Request::DisableTable { table }
            | Request::DeleteTable { table }
            | Request::GetRow { table, .. }
            | Request::GetRows { table, .. }
            | Request::MutateRow { table, .. }
            | Request::MutateRows { table, .. }
            | Request::DeleteAll { table, .. }
            | Request::DeleteAllRow { table, .. }
            | Request::Increment { table, .. }
            | Request::ScannerOpen { table, .. } => Some(table),
            Request::GetTableNames
            | Request::ScannerGetList { .. }
            | Request::ScannerClose { .. } => None,
        }
    }
}

/// Successful result payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Unit,
    Tables(Vec<String>),
    Rows(Vec<WireRow>),
    Scanner(u64),
    Counter(i64),
}

/// Backend answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Reply),
    Err(AppError),
}

impl From<Result<Reply, AppError>> for Response {
    fn from(result: Result<Reply, AppError>) -> Self {
        match result {
            Ok(reply) => Response::Ok(reply),
            Err(err) => Response::Err(err),
        }
    }
}

impl From<Response> for Result<Reply, AppError> {
    fn from(response: Response) -> Self {
        match response {
            Response::Ok(reply) => Ok(reply),
            Response::Err(err) => Err(err),
        }
    }
}

/// Appends one length-prefixed frame to `out`.
pub fn encode_frame<T: Serialize>(
    envelope: &Envelope<T>,
    out: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    out.reserve(FRAME_HEADER_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(())
}

/// Removes one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the frame is still
/// incomplete.
pub fn decode_frame<T: DeserializeOwned>(
    buf: &mut BytesMut,
) -> Result<Option<Envelope<T>>, ProtocolError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        buf.reserve(FRAME_HEADER_LEN + len - buf.len());
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    let body = buf.split_to(len);
    let envelope = serde_json::from_slice(&body)?;
    Ok(Some(envelope))
}
