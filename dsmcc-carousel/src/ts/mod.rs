//! Transport stream input: packet parsing and section reassembly.

pub mod assembler;
pub mod packet;

pub use assembler::SectionAssembler;
pub use packet::{TsPacket, TsPacketIterator, TS_PACKET_SIZE};
