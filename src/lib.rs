//! A Linux-only stackful fiber runtime: cooperative coroutines scheduled
//! M-on-N across a thread pool, with an epoll-backed reactor for IO and
//! timers and a hook layer that lets blocking-style calls park a fiber
//! instead of parking an OS thread.

pub mod clock;
pub mod error;
pub mod fd_manager;
pub mod fiber;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod thread_handle;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::{Fiber, State as FiberState};
pub use hook::{set_connect_timeout_ms, set_hook_enabled};
pub use reactor::{EventType, IoManager};
pub use scheduler::{Hooks, Scheduler};
pub use timer::{Timer, TimerManager};
