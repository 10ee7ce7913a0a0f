//! Host/display wire format.
//!
//! Every message is a JSON document preceded by its byte length as a little-endian
//! `u32`. Requests travel display -> host as `[route, args, kwargs]`; a `get` is
//! answered by exactly one reply document, a `post` by nothing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::relay::RelayError;

/// Largest accepted message body.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// A route invocation: `[route, args, kwargs]` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request(pub String, pub Vec<Value>, pub Map<String, Value>);

impl Request {
    /// Request with positional arguments only.
    pub fn new(route: impl Into<String>, args: Vec<Value>) -> Self {
        Request(route.into(), args, Map::new())
    }

    /// Route name.
    pub fn route(&self) -> &str {
        &self.0
    }
}

/// Write one length-prefixed message and flush.
pub async fn send<W, T>(writer: &mut W, message: &T) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(RelayError::MessageTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// End of stream before the length prefix is reported as [`RelayError::Closed`].
pub async fn recv<R, T>(reader: &mut R) -> Result<T, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RelayError::Closed)
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(RelayError::MessageTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Flatten serialized arguments into a positional list.
///
/// `()` becomes `[]`, tuples and sequences become their elements, anything else a
/// single argument.
pub fn encode_args<A: Serialize>(args: &A) -> Result<Vec<Value>, RelayError> {
    Ok(match serde_json::to_value(args)? {
        Value::Null => Vec::new(),
        Value::Array(values) => values,
        value => vec![value],
    })
}

/// Rebuild typed arguments from a positional list.
pub fn decode_args<A: DeserializeOwned>(mut args: Vec<Value>) -> Result<A, RelayError> {
    match args.len() {
        0 => Ok(serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Array(Vec::new())))?),
        1 => match serde_json::from_value(Value::Array(args.clone())) {
            Ok(decoded) => Ok(decoded),
            Err(_) => Ok(serde_json::from_value(args.remove(0))?),
        },
        _ => Ok(serde_json::from_value(Value::Array(args))?),
    }
}
