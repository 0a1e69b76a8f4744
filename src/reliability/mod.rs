pub mod clock_skew;
pub mod kill_switch;
pub mod retry;

pub use clock_skew::ClockSkewManager;
pub use kill_switch::{KillSwitch, THIS_REQUEST_ONLY};
pub use retry::{MAX_BACKOFF_MS, RetryPolicy};
