//! Configuration for the communication fabric.

#[cfg(feature = "getopts")]
use std::io::BufRead;

use crate::fabric::{ClusterBuilder, GenericBuilder, ProcessBuilder, ThreadBuilder};
use crate::Result;

/// Possible configurations for the communication fabric.
pub enum Config {
    /// Use one process.
    Thread,
    /// Use one OS process with an indicated number of simulation processes.
    Process(usize),
    /// One member of a multi-machine run: this process's index and the
    /// address list of all participants.
    Cluster {
        /// Identity of this process.
        process: usize,
        /// Addresses of all processes, indexed by process.
        addresses: Vec<String>,
    },
}

#[cfg(feature = "getopts")]
impl Config {
    /// Constructs a new configuration by parsing supplied text arguments.
    ///
    /// Most commonly, this uses `std::env::args()` as the supplied iterator.
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> std::result::Result<Config, String> {
        let mut opts = getopts::Options::new();
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");

        let matches = opts.parse(args).map_err(|e| format!("{:?}", e))?;

        let process: usize = matches
            .opt_str("p")
            .map(|x| x.parse().unwrap_or(0))
            .unwrap_or(0);
        let processes: usize = matches
            .opt_str("n")
            .map(|x| x.parse().unwrap_or(1))
            .unwrap_or(1);

        if process >= processes {
            return Err(format!("process index {} out of range (-n: {})", process, processes));
        }

        if processes > 1 {
            let mut addresses = Vec::with_capacity(processes);
            if let Some(hosts) = matches.opt_str("h") {
                let file = std::fs::File::open(hosts.clone()).map_err(|e| format!("{:?}", e))?;
                let reader = std::io::BufReader::new(file);
                for line in reader.lines().take(processes) {
                    addresses.push(line.map_err(|e| format!("{:?}", e))?);
                }
                if addresses.len() < processes {
                    return Err(format!(
                        "could only read {} addresses from {}, but -n: {}",
                        addresses.len(),
                        hosts,
                        processes
                    ));
                }
            } else {
                for index in 0..processes {
                    addresses.push(format!("localhost:{}", 2101 + index));
                }
            }
            Ok(Config::Cluster { process, addresses })
        } else {
            Ok(Config::Thread)
        }
    }
}

impl Config {
    /// Attempts to assemble the described communication fabric.
    ///
    /// For the `Process` configuration, one builder per simulation process is
    /// returned; each should move to its own thread. The cluster
    /// configuration blocks here until the socket mesh is up.
    pub fn try_build(self) -> Result<Vec<GenericBuilder>> {
        match self {
            Config::Thread => Ok(vec![GenericBuilder::Thread(ThreadBuilder)]),
            Config::Process(peers) => Ok(ProcessBuilder::new_vector(peers)
                .into_iter()
                .map(GenericBuilder::Process)
                .collect()),
            Config::Cluster { process, addresses } => {
                let builder = ClusterBuilder::connect(addresses, process)?;
                Ok(vec![GenericBuilder::Cluster(builder)])
            }
        }
    }
}
