//! # Keel Core
//!
//! Workflow declarations, the registry, and the scheduling client.
//!
//! A workflow is declared once (`declare(kind, name) ... .build()?`),
//! registered under a unique name, and from then on is a pure function of
//! its input: callers enqueue runs through [`Client`] and observe them
//! through [`RunHandle`].

pub mod client;
pub mod declaration;
pub mod error;
pub mod registry;

pub use keel_protocols::concurrency;

pub use client::{Client, RunHandle};
pub use declaration::{declare, DeclarationBuilder, HandlerRef, WorkflowDeclaration};
pub use error::CoreError;
pub use registry::Registry;
