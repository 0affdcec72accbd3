//! Mock agents and recorders shared by EvoFlow tests.

mod agents;
mod recorder;

pub use agents::{AgentCall, DispatchLog, RejectingAgent, ScriptedAgent, SlowAgent, Step};
pub use recorder::MemoryRecorder;
