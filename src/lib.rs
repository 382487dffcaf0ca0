#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod arena;
mod bins;
mod clock;
mod config;
mod error;
mod header;
mod llist;
mod oom_handler;
mod ptr_utils;
mod rmalloc;
mod span;

#[cfg(feature = "lock_api")]
mod rmlock;

pub use clock::{Clock, ManualClock};
#[cfg(feature = "std")]
pub use clock::StdClock;
pub use config::{Config, Placement};
pub use error::{InitError, InvariantViolation, Misuse, OutOfMemory};
pub use header::{ChunkState, Handle};
pub use oom_handler::{CompactOnOom, ErrOnOom, OomHandler};
pub use rmalloc::{BlockCounts, CompactionReport, LayoutMap, Rmalloc, MIN_REGION_SIZE};
#[cfg(feature = "counters")]
pub use rmalloc::counters::Counters;
#[cfg(feature = "lock_api")]
pub use rmlock::{AssumeUnlockable, Rmlock};
pub use span::Span;
