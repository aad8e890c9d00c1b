//! Control protocol for worker processes.
//!
//! Defines the messages exchanged between the pool and its workers over the
//! worker's stdin and stdout. Messages are serialized with rkyv and sent with
//! a 4-byte little-endian length prefix. Array data never goes through this
//! channel; only names and parameters do.

use super::task::Task;
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Message sent from the pool to a worker.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Liveness check. Answered with [`Response::Pong`].
    Ping {
        /// Sequence number echoed back.
        seq: u64,
    },

    /// Apply `task` to leading-axis indices `start..end`.
    Run {
        /// The work to do.
        task: Task,
        /// First index.
        start: u64,
        /// One past the last index.
        end: u64,
    },

    /// Exit the serve loop.
    Shutdown,
}

/// Message sent from a worker back to the pool.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Answer to [`Request::Ping`].
    Pong {
        /// Sequence number from the ping.
        seq: u64,
    },

    /// Every index of the chunk was processed.
    Done {
        /// First index.
        start: u64,
        /// One past the last index.
        end: u64,
    },

    /// Processing stopped at the first failing index.
    Failed {
        /// What went wrong.
        failure: TaskFailure,
    },
}

/// A task error in a form that survives the trip between processes.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum TaskFailure {
    /// An image did not have the stack's dimensions.
    Dimension {
        /// The offending file.
        path: String,
        /// Expected slice shape.
        expected: Vec<u64>,
        /// Shape of the file.
        actual: Vec<u64>,
    },
    /// An image could not be read.
    Load {
        /// The offending file.
        path: String,
        /// Underlying cause.
        reason: String,
    },
    /// Any other error, tagged with the index being processed.
    Task {
        /// Leading-axis index.
        index: u64,
        /// Rendered error.
        message: String,
    },
}

impl TaskFailure {
    /// Convert an error raised while processing. Errors that do not name an
    /// index are attributed to `index`.
    pub fn from_error(error: &Error, index: usize) -> Self {
        match error {
            Error::DimensionMismatch {
                path,
                expected,
                actual,
            } => Self::Dimension {
                path: path.to_string_lossy().into_owned(),
                expected: expected.iter().map(|&d| d as u64).collect(),
                actual: actual.iter().map(|&d| d as u64).collect(),
            },
            Error::Load { path, reason } => Self::Load {
                path: path.to_string_lossy().into_owned(),
                reason: reason.clone(),
            },
            Error::WorkerTask { index, message } => Self::Task {
                index: *index as u64,
                message: message.clone(),
            },
            other => Self::Task {
                index: index as u64,
                message: other.to_string(),
            },
        }
    }

    /// Rebuild the error on the receiving side.
    pub fn into_error(self) -> Error {
        match self {
            Self::Dimension {
                path,
                expected,
                actual,
            } => Error::DimensionMismatch {
                path: PathBuf::from(path),
                expected: expected.into_iter().map(|d| d as usize).collect(),
                actual: actual.into_iter().map(|d| d as usize).collect(),
            },
            Self::Load { path, reason } => Error::Load {
                path: PathBuf::from(path),
                reason,
            },
            Self::Task { index, message } => Error::WorkerTask {
                index: index as usize,
                message,
            },
        }
    }
}

/// A type that can travel over the control channel.
pub trait Message: Sized {
    /// Serialize to rkyv bytes.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Deserialize from rkyv bytes.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

macro_rules! impl_message {
    ($($ty:ty),*) => {
        $(
            impl Message for $ty {
                fn encode(&self) -> Result<Vec<u8>> {
                    rkyv::to_bytes::<rkyv::rancor::Error>(self)
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| Error::Protocol(format!("serialization failed: {e}")))
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    // rkyv needs an aligned buffer
                    let mut aligned = rkyv::util::AlignedVec::<16>::new();
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<$ty, rkyv::rancor::Error>(&aligned)
                        .map_err(|e| Error::Protocol(format!("deserialization failed: {e}")))
                }
            }
        )*
    };
}

impl_message!(Request, Response);

/// Frame a message for sending.
pub fn frame_message<M: Message>(msg: &M) -> Result<Vec<u8>> {
    let serialized = msg.encode()?;
    let len = u32::try_from(serialized.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Protocol(format!("message of {} bytes too large", serialized.len())))?;

    let mut framed = Vec::with_capacity(4 + serialized.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&serialized);
    Ok(framed)
}

/// Decode one framed message from the front of `buf`.
///
/// Returns the message and the number of bytes consumed, or `None` if `buf`
/// does not yet hold a complete frame.
pub fn unframe_message<M: Message>(buf: &[u8]) -> Result<Option<(M, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes too large")));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    let msg = M::decode(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}

/// Write one framed message. Does not flush.
pub fn write_message<W: Write, M: Message>(writer: &mut W, msg: &M) -> Result<()> {
    writer.write_all(&frame_message(msg)?)?;
    Ok(())
}

/// Read one framed message.
///
/// Returns `None` when the stream ends before a new frame starts.
pub fn read_message<R: Read, M: Message>(reader: &mut R) -> Result<Option<M>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes too large")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Protocol("stream ended inside a frame".into())
        } else {
            e.into()
        }
    })?;
    M::decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::task::{Roi, TaskKind};
    use crate::memory::{ArrayRef, DType};
    use std::io::Cursor;

    fn task() -> Task {
        Task {
            target: ArrayRef {
                name: "TP_42_abc".into(),
                shape: vec![20, 16, 16],
                dtype: DType::F32,
            },
            kind: TaskKind::LoadImages {
                paths: vec!["/data/a.tif".into(), "/data/b.tif".into()],
            },
            roi: None,
        }
    }

    #[test]
    fn test_message_framing() {
        let msg = Request::Ping { seq: 42 };
        let framed = frame_message(&msg).unwrap();

        let (decoded, consumed) = unframe_message::<Request>(&framed).unwrap().unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_framing_partial() {
        let msg = Response::Pong { seq: 123 };
        let framed = frame_message(&msg).unwrap();

        // Incomplete buffer
        assert!(unframe_message::<Response>(&framed[..2]).unwrap().is_none());
        assert!(unframe_message::<Response>(&framed[..4]).unwrap().is_none());
        assert!(unframe_message::<Response>(&framed[..framed.len() - 1])
            .unwrap()
            .is_none());

        // Complete buffer
        assert!(unframe_message::<Response>(&framed).unwrap().is_some());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(matches!(
            unframe_message::<Request>(&header),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            read_message::<_, Request>(&mut Cursor::new(header)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_stream_of_messages() {
        let run = Request::Run {
            task: task().with_roi(Roi::new(0, 0, 4, 4)),
            start: 3,
            end: 6,
        };
        let mut wire = Vec::new();
        write_message(&mut wire, &Request::Ping { seq: 1 }).unwrap();
        write_message(&mut wire, &run).unwrap();
        write_message(&mut wire, &Request::Shutdown).unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(read_message(&mut reader).unwrap(), Some(Request::Ping { seq: 1 }));
        assert_eq!(read_message(&mut reader).unwrap(), Some(run));
        assert_eq!(read_message(&mut reader).unwrap(), Some(Request::Shutdown));
        assert_eq!(read_message::<_, Request>(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_truncated_stream() {
        let mut wire = frame_message(&Response::Done { start: 0, end: 1 }).unwrap();
        wire.pop();
        assert!(matches!(
            read_message::<_, Response>(&mut Cursor::new(wire)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_failure_preserves_error_kind() {
        let errors = [
            Error::DimensionMismatch {
                path: "/data/b.tif".into(),
                expected: vec![16, 16],
                actual: vec![8, 16],
            },
            Error::Load {
                path: "/data/c.tif".into(),
                reason: "No such file or directory".into(),
            },
            Error::WorkerTask {
                index: 7,
                message: "boom".into(),
            },
        ];
        for error in errors {
            let expected = error.to_string();
            let failure = TaskFailure::from_error(&error, 0);
            let wire = frame_message(&Response::Failed { failure }).unwrap();
            let (decoded, _) = unframe_message::<Response>(&wire).unwrap().unwrap();
            let Response::Failed { failure } = decoded else {
                panic!("wrong message type");
            };
            assert_eq!(failure.into_error().to_string(), expected);
        }
    }

    #[test]
    fn test_unindexed_error_gets_fallback_index() {
        let failure = TaskFailure::from_error(&Error::PoolNotRunning, 9);
        assert!(matches!(
            failure.into_error(),
            Error::WorkerTask { index: 9, .. }
        ));
    }
}
