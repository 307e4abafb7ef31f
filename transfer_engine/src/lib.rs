mod completion;
mod control_channel;
mod error;
mod exchange;
mod ibverbs_primitives;
mod logging;
mod memory_region_map;
mod rdma_assignment;
mod rdma_context;
mod rdma_scheduler;
pub mod test_utils;

pub use completion::*;
pub use control_channel::*;
pub use error::*;
pub use exchange::*;
pub use ibverbs_primitives::*;
pub use logging::*;
pub use memory_region_map::*;
pub use rdma_assignment::*;
pub use rdma_context::*;
pub use rdma_scheduler::*;
