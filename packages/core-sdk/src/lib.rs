pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod proxy;
pub mod secret;
pub mod server;
pub mod sse;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::credentials::{self, CredentialResolver};
    pub use crate::db;
    pub use crate::error::{CompletionError, ErrorKind};
    pub use crate::llm::{self, CompletionClient, StreamSink};
    pub use crate::models::{self, CompletionRequest};
    pub use crate::proxy;
    pub use crate::secret::SecretCodec;
    pub use crate::server;
    pub use crate::sse::SseDecoder;
    pub use crate::telemetry;
}
