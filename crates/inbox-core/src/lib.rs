pub mod classifier;
pub mod cursor;
pub mod email;
pub mod errors;
pub mod events;
pub mod ids;
pub mod source;

pub use classifier::TriageClassifier;
pub use cursor::Cursor;
pub use email::{EmailRecord, MailMessage, Triage};
pub use errors::{AdapterError, ClassificationError};
pub use events::PushEvent;
pub use source::{MailAuthorizer, MailSource, MessageStream};
