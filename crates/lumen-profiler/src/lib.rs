//! Named-timer profiling for device operations
//!
//! A [`Profiler`] keeps one accumulator per timer id (integer or string key).
//! Each accumulator tracks count, min, max, sum and sum of squares, and
//! reports mean and standard deviation in a fixed-width table.
//!
//! The profiler is an ordinary value. Components that want to be timed take a
//! [`SharedProfiler`] at construction instead of reaching for a global.
//!
//! ```
//! use lumen_profiler::Profiler;
//!
//! let mut profiler = Profiler::new();
//! profiler.configure("kernel_ALL", "All kernels", 1, 0);
//!
//! profiler.start("kernel_ALL");
//! profiler.stop("kernel_ALL");
//!
//! assert_eq!(profiler.stats("kernel_ALL").unwrap().count, 1);
//! ```

mod profiler;
mod report;
mod timer;

pub use profiler::{lock, Profiler, ScopedTimer, SharedProfiler};
pub use timer::{TimerId, TimerStats};
