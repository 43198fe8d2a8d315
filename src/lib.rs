//! `dist-sort` is a distributed external merge sort over a pool of equal machines on a local network.
//!
//! One machine, the coordinator, holds the unsorted sequence. The others are workers merging pairs
//! of sorted runs on request. At any time one participant additionally acts as the leader, brokering
//! work between the coordinator and the worker pool. Leadership moves to a different worker after
//! every sort epoch and is recreated from scratch if no leader can be found.
//!
//! # Overview
//!
//! * **Bottom-up merge sort:**
//!   the sequence is merged in epochs, every epoch doubling the width of the sorted blocks
//!   (see [`PartitionTracker`]).
//! * **No fixed roles:**
//!   participants find the leader by a broadcast request (see [`Discovery`]), and the worker with the
//!   most completed tasks is elected as the next leader.
//! * **Failure recovery:**
//!   lost connections are dropped and rediscovered, lost tasks are handed out again.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io;
//! use std::thread;
//!
//! use dist_sort::{coordinator, CoordinatorBuilder, NetworkConfig, Worker};
//!
//! fn main() {
//!     let input = io::BufReader::new(fs::File::open("input.txt").unwrap());
//!     let sequence = coordinator::read_sequence(input).unwrap();
//!
//!     let network = NetworkConfig::new();
//!     let worker = {
//!         let network = network.clone();
//!         thread::spawn(move || Worker::new(network).run())
//!     };
//!
//!     let sorted = CoordinatorBuilder::new()
//!         .with_network(network)
//!         .with_output("output.txt")
//!         .build(sequence)
//!         .run()
//!         .unwrap();
//!
//!     println!("{} items sorted", sorted.len());
//!     worker.join().unwrap();
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod leader;
pub mod merger;
pub mod partition;
pub mod protocol;
pub mod worker;

pub use config::{NetworkConfig, Ports};
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorError};
pub use discovery::Discovery;
pub use leader::{spawn_leader, Leader, LeaderError};
pub use merger::merge;
pub use partition::{Applied, BlockStatus, PartitionTracker, Task};
pub use protocol::{Message, ProtocolError};
pub use worker::{Worker, WorkerExit, WorkerReport, WorkerState};
