pub mod collective;
pub mod config;
pub mod error;
pub mod fill;
pub mod partition;
pub mod protocol;
pub mod transport;
pub mod types;

pub use collective::{all_reduce, ReduceContext, WindowEngine};
pub use config::NetclConfig;
pub use error::{NetclError, Result};
pub use fill::FillMode;
pub use partition::{plan, Partition};
pub use protocol::{AggHeader, NcpHeader, PacketHeader, HEADER_LEN};
pub use transport::{Frame, RecvSlot, StrategyKind, Transport};
pub use types::{Rank, Version};
