pub mod error;
pub mod id;
pub mod model;
pub mod protocol;
pub mod settings;
pub mod time;

pub use error::{CoreError, ErrorCategory, Result};
pub use id::{ClientId, InboundId, generate_identifier, generate_password};
pub use model::{ClientRecord, InboundRecord, NewClient};
pub use protocol::{DocumentField, FieldRules, Protocol, ProtocolParams, SecretDefaults};
pub use settings::{InboundSettings, doc_keys};
pub use time::{DAY_MS, now_millis};
