//! A columnar on-disk container for probe output.
//!
//! The file carries a fixed header (magic, format version, timestep), one
//! declaration record per probe, and a stream of data blocks appended at
//! each flush. Blocks for the same probe concatenate into one dataset
//! dimensioned `(samples, signal shape)`; [`read_log`] reassembles them.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::signal::{Key, Tensor};

const MAGIC: &[u8; 4] = b"SPKF";
const VERSION: u32 = 1;

const RECORD_DECLARATION: u8 = 1;
const RECORD_BLOCK: u8 = 2;

/// Metadata written once per probe: identity, label, sample shape, period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDecl {
    pub key: Key,
    pub label: String,
    pub shape1: usize,
    pub shape2: usize,
    pub ndim: u8,
    pub period: u64,
}

/// One probe's reassembled dataset.
pub struct LogDataset {
    pub decl: ProbeDecl,
    pub samples: Vec<Tensor>,
}

/// Everything a log file holds.
pub struct LogContents {
    pub dt: f64,
    pub probes: BTreeMap<Key, LogDataset>,
}

/// Appends probe blocks to a columnar log file.
pub struct LogWriter {
    writer: BufWriter<File>,
}

impl LogWriter {
    /// Creates (or truncates) the file at `path`, writing the header and one
    /// declaration record per probe.
    pub fn create(path: &Path, dt: f64, decls: &[ProbeDecl]) -> io::Result<LogWriter> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        writer.write_f64::<LittleEndian>(dt)?;
        let mut log = LogWriter { writer };
        for decl in decls {
            log.write_declaration(decl)?;
        }
        Ok(log)
    }

    fn write_declaration(&mut self, decl: &ProbeDecl) -> io::Result<()> {
        let body = bincode::serialize(decl).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        self.writer.write_u8(RECORD_DECLARATION)?;
        self.writer.write_u32::<LittleEndian>(body.len() as u32)?;
        self.writer.write_all(&body)
    }

    /// Appends one block of samples for `key`. Empty blocks write nothing.
    pub fn append_block(&mut self, key: Key, samples: &[Tensor]) -> io::Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let sample_len = samples[0].len();
        self.writer.write_u8(RECORD_BLOCK)?;
        self.writer.write_u64::<LittleEndian>(key.0)?;
        self.writer.write_u32::<LittleEndian>(samples.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(sample_len as u32)?;
        for sample in samples {
            debug_assert_eq!(sample.len(), sample_len);
            for &value in sample.data() {
                self.writer.write_f64::<LittleEndian>(value)?;
            }
        }
        Ok(())
    }

    /// Flushes buffered records to the file.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Reads a log file back into per-probe datasets.
pub fn read_log(path: &Path) -> Result<LogContents> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(bad_data("not a probe log file"));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(bad_data(&format!("unsupported log version {}", version)));
    }
    let dt = reader.read_f64::<LittleEndian>()?;

    let mut probes: BTreeMap<Key, LogDataset> = BTreeMap::new();
    loop {
        let record = match reader.read_u8() {
            Ok(tag) => tag,
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => break,
            Err(error) => return Err(error.into()),
        };
        match record {
            RECORD_DECLARATION => {
                let length = reader.read_u32::<LittleEndian>()? as usize;
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body)?;
                let decl: ProbeDecl = bincode::deserialize(&body)?;
                probes
                    .entry(decl.key)
                    .or_insert_with(|| LogDataset { decl, samples: Vec::new() });
            }
            RECORD_BLOCK => {
                let key = Key(reader.read_u64::<LittleEndian>()?);
                let count = reader.read_u32::<LittleEndian>()? as usize;
                let sample_len = reader.read_u32::<LittleEndian>()? as usize;
                let dataset = probes
                    .get_mut(&key)
                    .ok_or_else(|| bad_data(&format!("block for undeclared probe {}", key)))?;
                for _ in 0..count {
                    let mut data = Vec::with_capacity(sample_len);
                    for _ in 0..sample_len {
                        data.push(reader.read_f64::<LittleEndian>()?);
                    }
                    let (shape1, shape2, ndim) =
                        (dataset.decl.shape1, dataset.decl.shape2, dataset.decl.ndim);
                    dataset.samples.push(Tensor::from_parts(data, shape1, shape2, ndim));
                }
            }
            other => return Err(bad_data(&format!("unknown record tag {}", other))),
        }
    }

    Ok(LogContents { dt, probes })
}

fn bad_data(message: &str) -> crate::error::Error {
    io::Error::new(ErrorKind::InvalidData, message.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_decl(key: Key) -> ProbeDecl {
        ProbeDecl {
            key,
            label: format!("probe-{}", key),
            shape1: 1,
            shape2: 1,
            ndim: 1,
            period: 1,
        }
    }

    #[test]
    fn blocks_concatenate_per_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.log");
        let decls = vec![scalar_decl(Key(1)), scalar_decl(Key(2))];

        let mut writer = LogWriter::create(&path, 0.001, &decls).unwrap();
        writer.append_block(Key(1), &[Tensor::scalar(1.0), Tensor::scalar(2.0)]).unwrap();
        writer.append_block(Key(2), &[Tensor::scalar(-1.0)]).unwrap();
        writer.append_block(Key(1), &[Tensor::scalar(3.0)]).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let contents = read_log(&path).unwrap();
        assert_eq!(contents.dt, 0.001);
        let first = &contents.probes[&Key(1)];
        assert_eq!(first.samples.len(), 3);
        assert_eq!(first.samples[2].data(), &[3.0]);
        assert_eq!(contents.probes[&Key(2)].samples.len(), 1);
    }

    #[test]
    fn empty_blocks_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.log");
        let mut writer = LogWriter::create(&path, 0.001, &[scalar_decl(Key(1))]).unwrap();
        writer.append_block(Key(1), &[]).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let contents = read_log(&path).unwrap();
        assert!(contents.probes[&Key(1)].samples.is_empty());
    }
}
