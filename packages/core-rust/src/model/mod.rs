//! Domain model: observables, metadata, analyses, submissions.

pub mod analysis;
pub mod metadata;
pub mod observable;
pub mod submission;

pub use analysis::{Analysis, AnalysisRecord, Status};
pub use metadata::{
    CriticalPoint, DetectionPoint, Directive, DisplayValue, Metadata, MetadataType, Tag, Time,
};
pub use observable::{
    EmailAddress, File, Fqdn, Hostname, Ipv4, Ipv6, Md5, Observable, ObservableType, Sha1,
    Sha256, Url, User,
};
pub use submission::Submission;
