//! Skitter core — runtime values, the callback IR, operation descriptors,
//! workflow graphs with flattening, and the multi-input matcher.
//!
//! Everything in this crate is synchronous and deterministic. The
//! distributed runtime lives in `skitter-server` and builds on these types.

pub mod callback;
pub mod flatten;
pub mod invocation;
pub mod matcher;
pub mod operation;
pub mod value;
pub mod workflow;

pub use callback::{Callback, CallbackError, CallbackInfo, CallbackResult, CallbackTrace, EmitMap};
pub use flatten::{flatten, Destination, FlatNode, FlattenedWorkflow};
pub use invocation::{Invocation, InvocationSource};
pub use matcher::{MatchOutcome, Matcher};
pub use operation::{DefinitionError, Operation, OperationBuilder, OperationRegistry};
pub use value::Value;
pub use workflow::{LinkTarget, Workflow, WorkflowBuilder, WorkflowNode};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
