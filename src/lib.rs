// SPDX-License-Identifier: MIT

//! flowbench: adaptive decision-tree test-flow engine
//!
//! `core` holds the experiment-session contract the engine consumes;
//! `flow` holds the graph builder, node policies, tracker and executor.

pub mod core;
pub mod flow;
