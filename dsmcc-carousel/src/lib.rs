//! dsmcc-carousel - DSM-CC object/data carousel receiver engine
//!
//! Turns sections delivered by a [`DvbStack`] into directory trees under
//! each subscriber's download path. All carousel state lives on one worker
//! task behind [`Engine`].

pub mod callbacks;
pub mod carousel;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_cache;
pub mod module;
pub mod orchestrator;
pub mod persist;
pub mod storage;
pub mod stream;
pub mod timeout;
pub mod ts;

// Re-export commonly used types
pub use callbacks::{CarouselListener, DvbStack, SubscriptionId};
pub use carousel::CarouselStatus;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, ModuleError, PersistError};
pub use ts::{SectionAssembler, TsPacket, TsPacketIterator, TS_PACKET_SIZE};
