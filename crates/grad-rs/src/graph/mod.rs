//! Define-by-run graph core.
//!
//! Values carry payloads and linkage, operation vertices record applied
//! functions, tapes drive the eager backward sweep, and compiled graphs
//! replay traced pipelines. Eager and compiled execution share the
//! pipeline utilities so there is exactly one backward algorithm.

mod compiled;
mod node;
mod pipeline;
pub mod session;
mod tape;
mod value;

pub use compiled::CompiledGraph;
pub use node::{apply, ForwardOutputs, InputGrads, OpNode, Operation};
pub use pipeline::{pack_variables, unpack_variables};
pub use session::{current_mode, ExecMode};
pub use tape::{is_recording, Tape};
pub use value::{Payload, Value, ValueHandle};
