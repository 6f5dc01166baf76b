//! Request description and classification.

mod classifier;
mod request;

pub use classifier::{AuthScope, Classified, ClassificationResult, Classifier, ProtectedPathSet};
pub use request::{Credential, FeedFormat, RequestDescriptor, SESSION_COOKIE};
