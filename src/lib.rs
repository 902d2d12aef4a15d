//! Persistent single-producer / multi-consumer append-only segmented log
//! queue on a local filesystem: a publisher appends framed records to a
//! directory of fixed-naming segment files; one or more subscribers tail
//! them with bounded-latency wakeups via a SysV-semaphore progress counter.

pub mod error;
pub mod frame;
pub mod lockfile;
pub mod mmap;
pub mod params;
pub mod publisher;
pub mod segment;
pub mod semaphore;
pub mod subscriber;
pub mod varint;

pub use error::{Error, Result};
pub use params::Params;
pub use publisher::Publisher;
pub use subscriber::Subscriber;
