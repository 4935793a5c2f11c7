//! Remote code execution over a connected session.
//!
//! A client ships position-independent machine code and an input buffer to
//! a server, which loads the code into an executable mapping, runs it under
//! an [`ExecutionPolicy`] and writes the result back. See [`server`] for the
//! phase sequence.
//!
//! Running peer-supplied code is inherently unsafe. The [`ExecutionPolicy`]
//! decides whether a request runs at all and the [`Invoker`] is the only
//! place that jumps into received code.

pub mod client;
pub mod code;
pub mod config;
pub mod error;
pub mod layout;
pub mod policy;
pub mod records;
pub mod server;

pub use client::LambdaClient;
pub use code::{CodeRegion, LambdaCode};
pub use config::{LambdaConfig, PolicyConfig, DEFAULT_MAX_CODE_SIZE};
pub use error::{LambdaError, Result};
pub use layout::RegionLayout;
pub use policy::{AllowAll, AllowList, DenyAll, ExecutionPolicy, Invocation, Invoker, NativeInvoker};
pub use records::{LambdaMetadata, LambdaRequestHeader, LambdaResult, Rejection};
pub use server::{LambdaServer, RequestOutcome};
