pub mod activity;
pub mod controller;
pub mod pull_loop;
pub mod synthetic;
pub mod worker_pool;

pub use activity::{ActivityToken, ActivityTracker};
pub use controller::*;
pub use pull_loop::{on_pull_loop_thread, AudioPullLoop, LoopContext, LoopStats, Medium, VideoPullLoop};
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use worker_pool::{JobHandle, WorkerPool};
