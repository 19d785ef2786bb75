pub mod config;
pub mod db;
pub mod git;
pub mod github;
pub mod notify;
pub mod payload;
pub mod reconciler;
pub mod resolver;
pub mod secrets;
pub mod signature;
pub mod webhook;

use std::sync::Arc;

use crate::db::Database;
use crate::git::CommitComparer;
use crate::notify::EventPublisher;
use crate::secrets::SecretCipher;

/// Shared application state, constructed once at startup and injected
/// into request handlers. The comparer and publisher are trait objects so
/// tests can substitute fakes for the GitHub API and the events gateway.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub comparer: Arc<dyn CommitComparer>,
    pub publisher: Arc<dyn EventPublisher>,
    pub cipher: SecretCipher,
}
