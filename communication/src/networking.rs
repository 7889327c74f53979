//! Networking code for establishing the socket mesh between simulation processes.

use std::io::{Read, Result, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Framing data for each payload crossing a socket: the sending process, the
/// channel tag, and the length in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Index of the process sending the message.
    pub source: u32,
    /// Tag of the channel the payload belongs to.
    pub tag: u32,
    /// Number of payload bytes following the header.
    pub length: u32,
}

impl MessageHeader {
    /// The number of bytes a header occupies on the wire.
    pub const BYTES: usize = 12;

    /// Writes the header as little-endian binary data.
    #[inline]
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.source)?;
        writer.write_u32::<LittleEndian>(self.tag)?;
        writer.write_u32::<LittleEndian>(self.length)
    }

    /// Reads a header from little-endian binary data.
    #[inline]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<MessageHeader> {
        Ok(MessageHeader {
            source: reader.read_u32::<LittleEndian>()?,
            tag: reader.read_u32::<LittleEndian>()?,
            length: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Creates socket connections from a list of host addresses.
///
/// The returned vector has one entry per process: `None` at `my_index`, and a
/// connected stream everywhere else. Lower-indexed processes connect to
/// higher-indexed ones, which accept, so each pair ends up with exactly one
/// stream between them.
pub fn create_sockets(addresses: Vec<String>, my_index: usize) -> Result<Vec<Option<TcpStream>>> {
    let hosts1 = Arc::new(addresses);
    let hosts2 = Arc::clone(&hosts1);

    let start_task = thread::spawn(move || start_connections(hosts1, my_index));
    let await_task = thread::spawn(move || await_connections(hosts2, my_index));

    let mut results = start_task.join().expect("connection thread panicked")?;
    results.push(None);
    let to_extend = await_task.join().expect("accept thread panicked")?;
    results.extend(to_extend);

    log::info!("process {}: socket mesh complete", my_index);

    Ok(results)
}

/// Connects to processes `0 .. my_index`, retrying until each accepts.
///
/// The result contains connections to `[0, my_index - 1]`.
pub fn start_connections(addresses: Arc<Vec<String>>, my_index: usize) -> Result<Vec<Option<TcpStream>>> {
    let mut results: Vec<_> = (0..my_index).map(|_| None).collect();
    for index in 0..my_index {
        loop {
            match TcpStream::connect(&addresses[index][..]) {
                Ok(mut stream) => {
                    stream.set_nodelay(true).expect("set_nodelay call failed");
                    stream.write_u64::<LittleEndian>(my_index as u64)?;
                    log::info!("process {}: connection to process {}", my_index, index);
                    results[index] = Some(stream);
                    break;
                }
                Err(error) => {
                    log::info!(
                        "process {}: error connecting to process {}: {}; retrying",
                        my_index,
                        index,
                        error
                    );
                    sleep(Duration::from_secs(1));
                }
            }
        }
    }

    Ok(results)
}

/// Accepts connections from processes `my_index + 1 .. addresses.len()`.
///
/// The result contains connections to `[my_index + 1, addresses.len() - 1]`.
pub fn await_connections(addresses: Arc<Vec<String>>, my_index: usize) -> Result<Vec<Option<TcpStream>>> {
    let mut results: Vec<_> = (my_index + 1..addresses.len()).map(|_| None).collect();
    let listener = TcpListener::bind(&addresses[my_index][..])?;

    for _ in my_index + 1..addresses.len() {
        let mut stream = listener.accept()?.0;
        stream.set_nodelay(true).expect("set_nodelay call failed");
        let identifier = stream.read_u64::<LittleEndian>()? as usize;
        log::info!("process {}: connection from process {}", my_index, identifier);
        results[identifier - my_index - 1] = Some(stream);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::MessageHeader;

    #[test]
    fn header_round_trip() {
        let header = MessageHeader { source: 3, tag: 17, length: 4096 };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), MessageHeader::BYTES);
        let decoded = MessageHeader::read_from(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, header);
    }
}
