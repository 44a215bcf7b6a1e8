//! Shared test harness: fixture keypair and configuration.

#![allow(dead_code)]

use athanor::prelude::*;
use std::path::Path;

pub const PRIVATE_PEM: &str = include_str!("../fixtures/signing_key.pem");
pub const PUBLIC_PEM: &str = include_str!("../fixtures/signing_key.pub.pem");

/// Config against a fresh database under `dir`, with the background
/// worker off so tests drive ticks explicitly.
pub fn test_config(dir: &Path) -> AuditConfig {
    let mut config = AuditConfig::new(
        dir.join("audit.db"),
        PRIVATE_PEM.to_string(),
        PUBLIC_PEM.to_string(),
    );
    config.store.pool_size = 4;
    config.backlog.enabled = false;
    config
}

pub fn submission(action: &str, crud: Crud, actor: &str) -> NewEvent {
    NewEvent::new(action, crud).with_actor(Actor::new(actor))
}
