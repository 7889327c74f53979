//! The typed build-record stream between the master and worker processes.
//!
//! During the build phase the master sends each worker a sequence of framed
//! records: a configuration record first, then signal/operator/probe
//! additions in any order, closed by a stop record. Each frame carries a
//! little-endian flag word identifying the record kind, followed by the
//! serialized body.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::operator::OpSpec;
use crate::signal::{Key, Tensor};

/// Flag word for the configuration record.
pub const FLAG_CONFIGURE: u32 = 0;
/// Flag word for a signal addition.
pub const FLAG_ADD_SIGNAL: u32 = 1;
/// Flag word for an operator addition.
pub const FLAG_ADD_OP: u32 = 2;
/// Flag word for a probe addition.
pub const FLAG_ADD_PROBE: u32 = 3;
/// Flag word closing the build stream.
pub const FLAG_STOP: u32 = 4;

/// One record of the build stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BuildRecord {
    /// Run-wide parameters; always the first record a worker sees.
    Configure { dt: f64, flush_every: u64, merged: bool },
    /// Add a base signal, payload included.
    AddSignal { key: Key, label: String, tensor: Tensor },
    /// Add an operator.
    AddOp { spec: OpSpec },
    /// Add a full-extent probe over a signal.
    AddProbe { probe: Key, signal: Key, period: u64 },
    /// Close the build stream.
    Stop,
}

impl BuildRecord {
    /// The flag word identifying this record kind on the wire.
    pub fn flag(&self) -> u32 {
        match self {
            BuildRecord::Configure { .. } => FLAG_CONFIGURE,
            BuildRecord::AddSignal { .. } => FLAG_ADD_SIGNAL,
            BuildRecord::AddOp { .. } => FLAG_ADD_OP,
            BuildRecord::AddProbe { .. } => FLAG_ADD_PROBE,
            BuildRecord::Stop => FLAG_STOP,
        }
    }

    /// Frames the record: the flag word followed by the serialized body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&self.flag().to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parses a framed record, checking the flag word against the body.
    pub fn decode(frame: &[u8]) -> Result<BuildRecord> {
        if frame.len() < 4 {
            return Err(BuildError::Protocol(format!("build frame of {} bytes", frame.len())).into());
        }
        let flag = LittleEndian::read_u32(&frame[..4]);
        let record: BuildRecord = bincode::deserialize(&frame[4..])?;
        if record.flag() != flag {
            return Err(BuildError::Protocol(format!(
                "flag {} does not match record kind {}",
                flag,
                record.flag()
            ))
            .into());
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_survive_framing() {
        let record = BuildRecord::AddSignal {
            key: Key(42),
            label: "input".into(),
            tensor: Tensor::vector(vec![1.0, 2.0]),
        };
        let frame = record.encode().unwrap();
        assert_eq!(LittleEndian::read_u32(&frame[..4]), FLAG_ADD_SIGNAL);
        match BuildRecord::decode(&frame).unwrap() {
            BuildRecord::AddSignal { key, label, tensor } => {
                assert_eq!(key, Key(42));
                assert_eq!(label, "input");
                assert_eq!(tensor.data(), &[1.0, 2.0]);
            }
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn truncated_frame_rejected() {
        assert!(BuildRecord::decode(&[1, 0]).is_err());
    }
}
