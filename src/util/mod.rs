//! Core containers: generational arena, case-insensitive dictionary,
//! IP radix tree and the event timer wheel.

pub mod arena;
pub mod dict;
pub mod patricia;
pub mod wheel;

pub use arena::{Arena, Handle};
pub use dict::Dictionary;
pub use patricia::PrefixMap;
pub use wheel::{TimerToken, TimerWheel};
