//! Cross-task reference tokens.
//!
//! Configuration values are scanned once at load time into a
//! [`ConfigTemplate`]. The graph builder reads the template's group
//! references to derive edges; the scheduler asks a [`Resolver`] to
//! substitute every token just before a node is dispatched.

mod path;
mod resolver;
mod secrets;
mod template;
mod token;

pub use resolver::Resolver;
pub use secrets::SecretStore;
pub use template::ConfigTemplate;
pub use token::{ReferenceToken, TokenParseError, GROUP_PREFIX, SECRET_PREFIX};
