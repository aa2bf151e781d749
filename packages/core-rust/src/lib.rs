//! Triage core: typed value registry, domain model, and dispatch envelopes.

pub mod catalog;
pub mod envelope;
pub mod error;
pub mod model;
pub mod registry;

pub use catalog::{Catalog, MetadataFamily, ObservableFamily};
pub use envelope::{Callback, Instruction, Invocation, ServiceId};
pub use error::{ModelError, Result};
pub use model::{
    Analysis, AnalysisRecord, CriticalPoint, DetectionPoint, Directive, DisplayValue,
    EmailAddress, File, Fqdn, Hostname, Ipv4, Ipv6, Md5, Metadata, MetadataType, Observable,
    ObservableType, Sha1, Sha256, Status, Submission, Tag, Time, Url, User,
};
pub use registry::{tag_of, Family, Fields, TypeRegistry, TYPE_FIELD};
