//! Body serialisation for each [`CodecType`].
//!
//! | Codec     | Encoding                                         |
//! |-----------|--------------------------------------------------|
//! | `Json`    | `serde_json`                                     |
//! | `Bincode` | `bincode` serde mode, standard configuration     |
//! | `Text`    | values that serialise as a string, as raw UTF-8  |
//! | `Raw`     | not available for typed values                   |

use bincode::config;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{buffer::Buffer, packet::CodecType};

/// Errors raised while converting typed values to and from bodies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PayloadError {
    /// JSON encoding or decoding failed.
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Bincode encoding failed.
    #[error("bincode encode: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),

    /// Bincode decoding failed.
    #[error("bincode decode: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),

    /// The codec cannot carry this value.
    #[error("codec {codec:?} cannot carry {what}")]
    Unsupported {
        /// Codec in use.
        codec: CodecType,
        /// What was attempted.
        what: &'static str,
    },

    /// A text body is not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidText,
}

/// Serialise `value` with `codec`.
///
/// # Errors
///
/// Returns [`PayloadError`] if the codec rejects the value.
///
/// ```
/// use kgnet::{codec::payload, packet::CodecType};
///
/// let buf = payload::encode(CodecType::Json, &serde_json::json!({"text": "x"})).unwrap();
/// assert_eq!(buf.bytes(), br#"{"text":"x"}"#);
/// ```
pub fn encode<T: Serialize + ?Sized>(codec: CodecType, value: &T) -> Result<Buffer, PayloadError> {
    let bytes = match codec {
        CodecType::Json => serde_json::to_vec(value)?,
        CodecType::Bincode => bincode::serde::encode_to_vec(value, config::standard())?,
        CodecType::Text => match serde_json::to_value(value)? {
            serde_json::Value::String(s) => s.into_bytes(),
            _ => {
                return Err(PayloadError::Unsupported {
                    codec,
                    what: "a non-string value",
                });
            }
        },
        CodecType::Raw => {
            return Err(PayloadError::Unsupported {
                codec,
                what: "typed values",
            });
        }
    };
    Ok(Buffer::from(bytes))
}

/// Deserialise the unread bytes of `buf` with `codec`.
///
/// # Errors
///
/// Returns [`PayloadError`] if the bytes do not decode.
pub fn decode<T: DeserializeOwned>(codec: CodecType, buf: &Buffer) -> Result<T, PayloadError> {
    let bytes = buf.bytes();
    match codec {
        CodecType::Json => Ok(serde_json::from_slice(&bytes)?),
        CodecType::Bincode => {
            let (value, _) = bincode::serde::decode_from_slice(&bytes, config::standard())?;
            Ok(value)
        }
        CodecType::Text => {
            let text = String::from_utf8(bytes).map_err(|_| PayloadError::InvalidText)?;
            Ok(serde_json::from_value(serde_json::Value::String(text))?)
        }
        CodecType::Raw => Err(PayloadError::Unsupported {
            codec,
            what: "typed values",
        }),
    }
}
