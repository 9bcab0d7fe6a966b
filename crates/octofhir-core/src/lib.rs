pub mod error;
pub mod events;
pub mod id;
pub mod xml;

pub use error::{CoreError, ErrorCategory, Result};
pub use id::{IdError, generate_id, validate_id};
pub use xml::to_fhir_xml;
