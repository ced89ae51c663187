//! Turnstile Core
//!
//! 多人同传会话的轮次协调：同一时刻只允许一人发言，识别结果依次翻译、
//! 合成并播放给其他语种的参与者，发言时长按分钟计费并异步写入账本。

pub mod billing;
pub mod clock;
pub mod services;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod turn;
