//! # deviceplane-id
//!
//! Typed identifiers for resources owned by the deviceplane controller.
//!
//! ## Design Principles
//!
//! - IDs are issued by the controller; the agent never mints them
//! - Every ID is usable verbatim as a URL path segment
//! - IDs are typed so an application id cannot be passed where a device id
//!   is expected
//!
//! ## ID Format
//!
//! IDs are opaque, non-empty strings. The controller currently issues
//! prefixed values such as `dev_1d2FQH4XmOpq` or `app_1d2FQKz9wBcd`, but the
//! agent does not depend on the prefix. The only constraint enforced here is
//! that the value contains no characters that would change the meaning of a
//! URL path (`/`, `?`, `#`, `%`) and no whitespace.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
