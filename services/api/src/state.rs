//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the stores and the live model transport.

use crate::config::Config;
use propscout_core::live::LiveTransport;
use propscout_core::store::{ConversationStore, FavoritesStore, LeadDirectory};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub favorites: Arc<dyn FavoritesStore>,
    pub leads: Arc<dyn LeadDirectory>,
    pub transport: Arc<dyn LiveTransport>,
    pub system_prompt: Arc<String>,
    pub config: Arc<Config>,
}
