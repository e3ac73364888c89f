//! Declarative YAML run configuration
//!
//! # Example
//!
//! ```yaml
//! model:
//!   seed: 0
//!   inputs:
//!     - name: input
//!       shape: [8, 8, 3]
//!   layers:
//!     - name: conv
//!       op: conv2d
//!       filters: 4
//!       kernel_size: [3, 3]
//!       padding: same
//!       inputs: [input]
//!     - name: conv_1
//!       reuse: conv
//!       inputs: [conv]
//!   outputs: [conv_1]
//!
//! dataset:
//!   kind: random_normal
//!   batch_size: 2
//!   num_batches: 8
//!
//! hessian:
//!   num_iterations: 50
//!   seed: 1
//! ```

mod cli;
mod load;
mod schema;
mod validate;


pub use cli::{
    apply_overrides, parse_args, Cli, Command, GranularityArg, HessianArgs, InfoArgs, ModeArg,
    OutputFormat, ValidateArgs,
};
pub use load::{build_dataset, build_graph, load_config, parse_config};
pub use schema::{parse_tensor_ref, DatasetSpec, InputSpec, LayerSpec, ModelSpec, RunSpec};
pub use validate::{validate_config, ValidationError};
