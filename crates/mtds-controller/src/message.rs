//! Control-plane message schema
//!
//! Every message is a CBOR map whose `type` field names the variant. Decoding
//! first reads the tag so that an unrecognised tag and a malformed payload
//! are reported as different errors.

use ciborium::Value;
use mtds_types::MtdsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the discriminant field
pub const TAG_FIELD: &str = "type";

/// Worker announces itself and the address of its reply socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMsg {
    pub instance_id: String,
    pub worker_id: u32,
    pub ip: String,
    pub port: u16,
}

/// Worker leaves the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeRegisterMsg {
    pub instance_id: String,
    pub worker_id: u32,
    pub ip: String,
    pub port: u16,
}

/// A chunk became resident in a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvAdmitMsg {
    pub instance_id: String,
    pub worker_id: u32,
    pub key: String,
    pub location: String,
}

/// A chunk left a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEvictMsg {
    pub instance_id: String,
    pub worker_id: u32,
    pub key: String,
    pub location: String,
}

/// Controller asks the worker to drop cached chunks; `None` drops everything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearWorkerMsg {
    pub tokens: Option<Vec<u32>>,
}

/// Reply to [`ClearWorkerMsg`]; `success` is false when nothing was removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearWorkerRetMsg {
    pub success: bool,
}

/// Reply to any request the worker could not serve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub error: String,
}

/// Every message that travels the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Msg {
    #[serde(rename = "RegisterMsg")]
    Register(RegisterMsg),
    #[serde(rename = "DeRegisterMsg")]
    DeRegister(DeRegisterMsg),
    #[serde(rename = "KVAdmitMsg")]
    KvAdmit(KvAdmitMsg),
    #[serde(rename = "KVEvictMsg")]
    KvEvict(KvEvictMsg),
    #[serde(rename = "ClearWorkerMsg")]
    ClearWorker(ClearWorkerMsg),
    #[serde(rename = "ClearWorkerRetMsg")]
    ClearWorkerRet(ClearWorkerRetMsg),
    #[serde(rename = "ErrorMsg")]
    Error(ErrorMsg),
}

/// Tags [`Msg::decode`] accepts
pub const KNOWN_TAGS: [&str; 7] = [
    "RegisterMsg",
    "DeRegisterMsg",
    "KVAdmitMsg",
    "KVEvictMsg",
    "ClearWorkerMsg",
    "ClearWorkerRetMsg",
    "ErrorMsg",
];

/// Why a frame could not be turned into a [`Msg`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown message type {0:?}")]
    UnknownTag(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<DecodeError> for MtdsError {
    fn from(err: DecodeError) -> Self {
        MtdsError::protocol(err.to_string())
    }
}

impl Msg {
    pub fn tag(&self) -> &'static str {
        match self {
            Msg::Register(_) => "RegisterMsg",
            Msg::DeRegister(_) => "DeRegisterMsg",
            Msg::KvAdmit(_) => "KVAdmitMsg",
            Msg::KvEvict(_) => "KVEvictMsg",
            Msg::ClearWorker(_) => "ClearWorkerMsg",
            Msg::ClearWorkerRet(_) => "ClearWorkerRetMsg",
            Msg::Error(_) => "ErrorMsg",
        }
    }

    /// Whether the worker sends this on its push channel
    pub fn is_worker_event(&self) -> bool {
        matches!(
            self,
            Msg::Register(_) | Msg::DeRegister(_) | Msg::KvAdmit(_) | Msg::KvEvict(_)
        )
    }

    pub fn encode(&self) -> mtds_types::Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| MtdsError::serialization(format!("Failed to encode {}: {}", self.tag(), e)))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Msg, DecodeError> {
        let value: Value =
            ciborium::from_reader(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let tag = message_tag(&value)?;
        if !KNOWN_TAGS.contains(&tag.as_str()) {
            return Err(DecodeError::UnknownTag(tag));
        }
        value
            .deserialized()
            .map_err(|e| DecodeError::Malformed(format!("{}: {}", tag, e)))
    }
}

fn message_tag(value: &Value) -> Result<String, DecodeError> {
    let Value::Map(entries) = value else {
        return Err(DecodeError::Malformed("message is not a map".to_string()));
    };
    entries
        .iter()
        .find_map(|(k, v)| match (k, v) {
            (Value::Text(k), Value::Text(tag)) if k == TAG_FIELD => Some(tag.clone()),
            _ => None,
        })
        .ok_or_else(|| DecodeError::Malformed(format!("missing {:?} field", TAG_FIELD)))
}

macro_rules! impl_into_msg {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Msg {
                fn from(msg: $ty) -> Self {
                    Msg::$variant(msg)
                }
            }
        )*
    };
}

impl_into_msg! {
    RegisterMsg => Register,
    DeRegisterMsg => DeRegister,
    KvAdmitMsg => KvAdmit,
    KvEvictMsg => KvEvict,
    ClearWorkerMsg => ClearWorker,
    ClearWorkerRetMsg => ClearWorkerRet,
    ErrorMsg => Error,
}
