//! ONNX export: protobuf messages, graph tracing and artifact I/O.

mod export;
pub mod proto;
mod tracer;

pub use export::{
    build_model, ir_version_for_opset, read_model, write_model, ExportConfig, MAX_OPSET, MIN_OPSET,
};
pub use tracer::{tensor_values, GraphTracer, Trace, TracedValue};
