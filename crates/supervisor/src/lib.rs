pub mod config;
pub mod error;
pub mod error_tail;
pub mod gpu;
pub mod normalize;
pub mod retry;
pub mod runner;
pub mod sample;
pub mod sampler;
pub mod stall;
pub mod supervisor;
pub mod telemetry;

pub use config::SupervisorConfig;
pub use error::{SupervisorError, SupervisorResult};
pub use gpu::{GpuInfo, GpuInventory, NvidiaSmi, StaticInventory};
pub use retry::{decide, Action, Decision, Invocation, RetryPolicy, RetryState};
pub use sample::{Sample, SampleDecoder, Timestamp};
pub use sampler::{ConditionFlags, ProgressSampler};
pub use supervisor::{Outcome, Supervisor};
pub use telemetry::{Event, JsonLines, Telemetry};
