mod pause;
pub mod timer;

pub use self::pause::{PausableFuture, PauseToken, ReadyFuture};
