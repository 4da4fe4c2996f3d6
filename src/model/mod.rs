//! Operator graphs and their expansion into computation tiles.
//!
//! The ONNX protobuf decoder lives outside this crate; its output arrives
//! here as a [`graph::GraphSummary`] with typed tensor edges. A [`Model`]
//! wires that summary into an operation DAG, infers tensor shapes, assigns
//! synthetic DRAM addresses, and expands every operation into tiles through
//! the [`mapping::MappingTable`].

pub mod graph;
pub mod mapping;
pub mod model;
pub mod operation;
pub mod tensor;

pub use graph::{Attribute, GraphSummary, NodeSummary, ValueInfo};
pub use mapping::{Mapping, MappingTable};
pub use model::{Model, ModelError, ModelOptions, ModelPool};
pub use operation::{OpKind, Operation};
pub use tensor::Tensor;
