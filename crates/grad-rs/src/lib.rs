mod env;
pub mod error;
pub mod graph;
pub mod ops;
pub mod profiling;
pub mod tensor;

pub use error::{GraphError, Result};
pub use graph::{
    apply, current_mode, is_recording, pack_variables, unpack_variables, CompiledGraph, ExecMode,
    OpNode, Operation, Payload, Tape, Value, ValueHandle,
};
pub use tensor::{DType, Shape, Tensor};
