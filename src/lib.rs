pub mod memory;
pub mod decode;
pub mod fault;
pub mod machine;
pub mod io;
pub mod pipeline;
pub mod image;
pub mod disasm;

pub use fault::Fault;
pub use io::{ChannelIo, ChannelLedger, FnIo, Io, QueueIo};
pub use machine::{Machine, RunOutcome, Step};
pub use memory::Memory;
