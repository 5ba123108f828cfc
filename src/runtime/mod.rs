// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Object model: the runtime handle, POAs, servants, proxies and the
//! distributed reference machinery.

/// Object slot tables and guards.
pub mod object_table;
/// Portable Object Adapter.
pub mod poa;
/// Client-side object handles.
pub mod proxy;
/// Per-session servant references.
pub mod reference_list;
/// The runtime handle.
pub mod rpc;
/// Servant trait and dispatch helpers.
pub mod servant;

use thiserror::Error;

use crate::wire::header::MessageId;

/// Errors a caller can observe from a call, mirroring the wire-level
/// standard-reply taxonomy plus local failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("target POA does not exist")]
    PoaNotExist,
    #[error("target object does not exist")]
    ObjectNotExist,
    #[error("communication failure: {0}")]
    CommFailure(String),
    #[error("unknown function index")]
    UnknownFunctionIdx,
    #[error("unknown message id")]
    UnknownMessageId,
    #[error("transport not permitted by activation flags")]
    BadAccess,
    #[error("malformed input")]
    BadInput,
    #[error("call timed out")]
    TimedOut,
    #[error("operation aborted")]
    Aborted,
}

impl RpcError {
    /// Maps an error-kind reply to the error the caller observes.
    pub fn from_message_id(id: MessageId) -> Option<Self> {
        Some(match id {
            MessageId::ErrorPoaNotExist => Self::PoaNotExist,
            MessageId::ErrorObjectNotExist => Self::ObjectNotExist,
            MessageId::ErrorCommFailure => {
                Self::CommFailure("reported by peer".to_string())
            },
            MessageId::ErrorUnknownFunctionIdx => Self::UnknownFunctionIdx,
            MessageId::ErrorUnknownMessageId => Self::UnknownMessageId,
            MessageId::ErrorBadAccess => Self::BadAccess,
            MessageId::ErrorBadInput => Self::BadInput,
            _ => return None,
        })
    }

    /// The reply kind a server emits for this error.
    pub fn as_message_id(&self) -> MessageId {
        match self {
            Self::PoaNotExist => MessageId::ErrorPoaNotExist,
            Self::ObjectNotExist => MessageId::ErrorObjectNotExist,
            Self::CommFailure(_) | Self::TimedOut | Self::Aborted => {
                MessageId::ErrorCommFailure
            },
            Self::UnknownFunctionIdx => MessageId::ErrorUnknownFunctionIdx,
            Self::UnknownMessageId => MessageId::ErrorUnknownMessageId,
            Self::BadAccess => MessageId::ErrorBadAccess,
            Self::BadInput => MessageId::ErrorBadInput,
        }
    }
}
