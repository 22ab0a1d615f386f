//! Credit-based congestion control for the stream send side.

mod window;

pub(crate) use window::{FlowController, WaitDecision};
