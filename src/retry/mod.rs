pub mod classifier;
pub mod policy;

pub use classifier::{ClassifiedError, ErrorClassifier, ErrorHandlingDecision, ErrorKey, ErrorType};
pub use policy::{ErrorSeverity, RetryPolicy, RetryStrategy};
