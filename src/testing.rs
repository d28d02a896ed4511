//! Fixtures shared by the unit test modules.
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Auth, Backend, MemoryBackend};
use crate::schemas::Session;
use crate::token::SessionSigner;

pub const PASSWORD: &str = "correct horse";

pub fn memory_backend() -> (Backend, Arc<MemoryBackend>) {
    let memory = Arc::new(MemoryBackend::new(SessionSigner::new(
        "test-secret",
        Duration::from_secs(600),
    )));
    (Backend::new(memory.clone()), memory)
}

pub async fn signed_in(memory: &MemoryBackend, email: &str) -> Session {
    memory.sign_up(email, PASSWORD).await.expect("sign up");
    memory
        .sign_in_with_password(email, PASSWORD)
        .await
        .expect("sign in")
}
