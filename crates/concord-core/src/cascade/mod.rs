//! Rule-driven propagation of field changes across document types.

mod evaluator;
pub mod transform;

pub use evaluator::CascadeEvaluator;
pub use transform::FormatKind;
