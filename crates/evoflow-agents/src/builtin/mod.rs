pub mod delay;
pub mod echo;
pub mod merge;

pub use delay::DelayAgent;
pub use echo::EchoAgent;
pub use merge::MergeAgent;
