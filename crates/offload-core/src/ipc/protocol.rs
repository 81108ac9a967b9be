//! IPC protocol messages between a parent and its forked worker processes.
//!
//! Uses length-prefixed rkyv messages over a pair of pipes.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//!
//! Caller values (arguments, return values) travel inside the messages as
//! opaque bincode payloads, so the frame types stay concrete.

use std::io::{ErrorKind, Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::outcome::WorkerFailure;

/// Bytes of the little-endian `u32` length in front of every frame.
pub const LENGTH_PREFIX: usize = 4;

/// Message sent from parent to worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum ParentMessage {
    /// Start token: run the callable with these bincode-encoded arguments.
    Start {
        /// Serialized arguments.
        args: Vec<u8>,
    },
}

/// Message sent from worker process to parent.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum ChildMessage {
    /// Worker is parked on the start barrier.
    Ready,

    /// Callable returned normally.
    Success {
        /// bincode-encoded return value.
        payload: Vec<u8>,
    },

    /// Callable failed, or its outcome could not be encoded.
    Failure(WorkerFailure),
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// Returns `Ok(None)` when the stream ends before a length prefix is complete,
/// i.e. the peer closed its end without sending anything more.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when reading from trusted
/// sources (our own forked workers or their parent).
pub fn read_message<R: Read, T>(reader: &mut R, max_len: usize) -> Result<Option<T>>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e)));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes (limit {})",
            len, max_len
        )));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // SAFETY: frames only ever come from the other end of a pipe pair we
    // created, written by `write_message` in the same binary.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(Some(message))
}
