//! spead-core: SPEAD heap generation, packetization and reassembly
//!
//! SPEAD (Streaming Protocol for Exchanging Astronomical Data) moves typed,
//! shaped items between producers and consumers over unreliable datagram
//! transports. Every heap carries the descriptors a receiver needs to
//! interpret it, so a consumer can join a stream knowing nothing in advance.
//!
//! # Architecture
//!
//! ```text
//! ItemGroup -> HeapGenerator -> Heap -> packetize -> PacketSink
//!                                                        |
//! ItemGroup <- update <- FrozenHeap <- Reassembler <- PacketSource
//! ```
//!
//! - `bitio`: Low-level bit reading/writing
//! - `flavour`: Heap address width, bug-compat flags, item pointers
//! - `dtype` / `descriptor` / `value`: Item metadata and the value codec
//! - `item`: Items and item groups
//! - `heap` / `packet`: Heaps and their wire packets
//! - `generator` / `reassembly`: Send and receive state machines
//! - `transport` / `network`: Packet sinks and sources, simulated link
//! - `stream` / `thread_pool`: Streams running on worker threads
//! - `metrics`: Observable stream behavior
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and recoverable
//! - **Bounded memory**: Partial heaps, finished-heap history and the
//!   receive ring all have fixed limits
//! - **Deterministic**: Seeded randomness makes simulated runs reproducible
//! - **Order independent**: Any arrival order of a heap's packets, with any
//!   duplicates, produces the same heap

pub mod bitio;
pub mod config;
pub mod descriptor;
pub mod dtype;
pub mod error;
pub mod flavour;
pub mod generator;
pub mod heap;
pub mod item;
pub mod metrics;
pub mod network;
pub mod packet;
pub mod ranges;
pub mod reassembly;
pub mod stream;
pub mod thread_pool;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use config::StreamConfig;
pub use descriptor::{Dim, ItemDescriptor};
pub use dtype::{DType, Endian, Order};
pub use error::{Error, Result};
pub use flavour::{BugCompat, Flavour};
pub use generator::{HeapGenerator, Selection};
pub use heap::{FrozenHeap, Heap};
pub use item::{Item, ItemGroup, UpdateReport};
pub use reassembly::{Reassembler, ReassemblerConfig, ReassemblyEvent};
pub use stream::{RecvStream, SendStream};
pub use thread_pool::ThreadPool;
pub use value::Value;
