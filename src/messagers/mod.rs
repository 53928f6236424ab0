//! Messager framework
//!
//! A [`Messager`] turns one input message into [`Action`]s. The framework
//! executes them against the object store, announces which catalogue
//! entries were added, updated or deleted, and reduces every error to a
//! [`Failures`] value that the runner turns into an ack or nack.
//!
//! ## Key Components
//!
//! - [`Messager`] - Core trait, with the provided `consume`
//! - [`CatalogueChangeMessager`] - Fans a catalogue change message out per key
//! - [`BodyFetcher`] / [`StacFilter`] - Wrappers that fetch bodies and keep
//!   only STAC documents
//! - [`JsonMessager`] - Typed JSON payloads outside the catalogue envelope
//! - [`MessagerRegistry`] - Topic to messager binding used by the runner
//!
//! ## Example
//!
//! ```rust,ignore
//! struct Ingester;
//!
//! #[async_trait]
//! impl StacHandler for Ingester {
//!     async fn process_update_stac(&self, doc, entry) -> Result<Vec<Action>, MessagerError> {
//!         Ok(vec![Action::write_entry(&entry.cat_path, serde_json::to_vec(&doc)?)])
//!     }
//!     async fn process_delete(&self, entry) -> Result<Vec<Action>, MessagerError> {
//!         Ok(vec![Action::delete_entry(&entry.cat_path)])
//!     }
//! }
//!
//! let messager = CatalogueChangeMessager::with_stac_handler(Ingester, context);
//! let failures = messager.consume(&message).await;
//! ```

mod body;
mod catalogue;
mod executor;
mod json;
mod registry;
mod stac;
mod traits;
mod types;

pub use body::{BodyFetcher, CatalogueBodyHandler, EntryBody, NOT_FOUND_ATTEMPTS};
pub use catalogue::{CatalogueChangeHandler, CatalogueChangeMessager, ChangedEntry};
pub use executor::ActionExecutor;
pub use json::{JsonMessager, PayloadHandler};
pub use registry::{MessagerRegistry, RegistryError};
pub use stac::{STAC_VERSION_FIELD, StacFilter, StacHandler};
pub use traits::{Messager, MessagerContext, MessagerError};
pub use types::{
    Action, CatalogueChangeMessage, CatalogueChanges, CatalogueEntryAction,
    DEFAULT_CONTENT_TYPE, DirectBlobAction, FailureAction, Failures,
};
