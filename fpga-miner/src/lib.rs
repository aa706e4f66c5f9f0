//! Getwork miner for FPGA compute modules.
//!
//! One scheduler task per bus polls the attached devices for results, feeds
//! them work fetched from a getwork pool and tunes their clock against an
//! online error-rate model. A shared block monitor tells the sessions when
//! the block changed so results for old work are not resubmitted past one
//! block boundary.

pub mod backplane;
pub mod block_monitor;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod frequency;
pub mod pool;
pub mod pow;
pub mod scheduler;
pub mod session;
pub mod share_log;
pub mod tracing;
pub mod transport;
pub mod types;
pub mod work;
