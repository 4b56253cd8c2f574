//! # Keel Toolbox
//!
//! Model-driven tool selection: a [`Toolbox`] presents registered tool
//! declarations to a language model, validates the selections it proposes,
//! and executes them through the scheduling client. The model is a
//! pluggable [`LlmProvider`]; a scripted [`MockProvider`] ships for tests.

pub mod error;
pub mod mock;
pub mod provider;
pub mod result;
pub mod selection;
pub mod toolbox;

pub use error::ToolboxError;
pub use mock::MockProvider;
pub use provider::{GenerateRequest, GenerateResponse, LlmProvider};
pub use result::{assert_exhaustive, ToolResult};
pub use selection::ToolSelection;
pub use toolbox::Toolbox;
