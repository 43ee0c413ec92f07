//! Partial refresh: live preview of setting changes without full reloads.
//!
//! A customization pane edits settings; a preview shows the page those
//! settings produce. Instead of reloading the preview on every keystroke,
//! the preview re-renders only the regions (partials) a change affects.
//!
//! # Architecture
//!
//! - **Registry and resolver**: partials and the rules relating settings to
//!   them, with per-type behavior selected at registration
//! - **Batcher**: coalesces refreshes in a debounce window into one render
//!   round trip and supersedes stale ones
//! - **Dispatch**: the wire format and transports to the render authority
//! - **Authority**: validates tokens, applies proposed values and renders each
//!   placement, verifying signed structural contexts
//! - **Reconciler**: applies rendered content to the live document and keeps
//!   list members in order
//! - **Messenger**: the channel between the pane and the preview

pub mod authority;
pub mod batcher;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod fallback;
pub mod messenger;
pub mod pane;
pub mod partial;
pub mod placement;
pub mod preview;
pub mod reconcile;
pub mod resolver;
pub mod settings;
pub mod signature;

pub use authority::{AuthorityServer, RenderAuthority};
pub use batcher::{RefreshHandle, RenderBatcher};
pub use config::RefreshConfig;
pub use error::{ErrorCode, RefreshError, Result};
pub use messenger::Messenger;
pub use pane::PaneSession;
pub use partial::{Partial, PartialDescriptor, PartialRegistry};
pub use preview::{PreviewEvent, PreviewSession};
pub use resolver::{DependencyResolver, TransportMode};
pub use settings::{InMemorySettings, SettingsStore};
pub use signature::ContextSigner;
