//! Weave: Design-to-Module Generation Pipeline
//!
//! Converts a design asset (an uploaded image or an HTML fragment) into a
//! packaged, field-mapped UI module through five fixed phases, using a
//! generative backend to synthesize markup and a quality-gated refinement
//! loop to improve it before packaging.

pub mod assemble;
pub mod backend;
pub mod config;
pub mod error;
pub mod generate;
pub mod input;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod refine;
pub mod schema;
pub mod score;
pub mod section;
pub mod split;
pub mod types;
