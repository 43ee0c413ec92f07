//! The render authority: validates batches and re-renders partials against
//! proposed setting values.

pub mod page;
pub mod render;
pub mod server;
pub mod tokens;

pub use page::PageEmitter;
pub use render::{CallbackRenderer, ListMemberRenderer, TemplateRenderer};
pub use server::AuthorityServer;
pub use tokens::{TokenRegistry, TokenValidator};

use crate::dispatch::wire::{RenderRequest, RenderResponse, RenderedItem};
use crate::error::ErrorCode;
use crate::settings::SettingsStore;
use crate::signature::ContextSigner;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// Setting values as the renderer must see them: proposed values first,
/// persisted values otherwise.
pub struct PreviewState<'a> {
    persisted: &'a dyn SettingsStore,
    overrides: &'a BTreeMap<String, Value>,
}

impl<'a> PreviewState<'a> {
    #[must_use]
    pub fn new(persisted: &'a dyn SettingsStore, overrides: &'a BTreeMap<String, Value>) -> Self {
        Self {
            persisted,
            overrides,
        }
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.overrides
            .get(id)
            .cloned()
            .or_else(|| self.persisted.get(id))
    }
}

/// A partial known to the authority.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityPartial {
    pub id: String,
    pub kind: String,
    pub settings: Vec<String>,
}

impl AuthorityPartial {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            settings: vec![id.clone()],
            id,
            kind: kind.into(),
        }
    }

    #[must_use]
    pub fn with_settings<I, S>(mut self, settings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let settings: Vec<String> = settings.into_iter().map(Into::into).collect();
        if !settings.is_empty() {
            self.settings = settings;
        }
        self
    }
}

/// One renderer invocation.
pub struct RenderCall<'a> {
    pub partial: &'a AuthorityPartial,
    /// The placement context, signature already verified and stripped.
    pub context: Option<&'a Value>,
    pub state: &'a PreviewState<'a>,
}

/// Renderer result: markup, nothing, or a per-container error.
pub type RenderOutcome = Result<Option<String>, ErrorCode>;

/// Produces markup for one partial type (or one partial).
pub trait Renderer: Send + Sync {
    /// Whether contexts must carry a valid signature.
    fn requires_signed_context(&self) -> bool {
        false
    }

    fn render(&self, call: &RenderCall<'_>) -> RenderOutcome;
}

struct Registered {
    partial: Arc<AuthorityPartial>,
    renderer: Option<Arc<dyn Renderer>>,
}

/// Serves render batches.
pub struct RenderAuthority {
    tokens: Arc<dyn TokenValidator>,
    signer: ContextSigner,
    persisted: Arc<dyn SettingsStore>,
    partials: RwLock<HashMap<String, Registered>>,
    dynamic: RwLock<Vec<(String, String)>>,
    renderers: RwLock<HashMap<String, Arc<dyn Renderer>>>,
}

impl RenderAuthority {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenValidator>,
        signer: ContextSigner,
        persisted: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            tokens,
            signer,
            persisted,
            partials: RwLock::new(HashMap::new()),
            dynamic: RwLock::new(Vec::new()),
            renderers: RwLock::new(HashMap::new()),
        }
    }

    /// Signer shared with the page emitter.
    pub fn signer(&self) -> &ContextSigner {
        &self.signer
    }

    /// Register a partial rendered by its type's renderer.
    pub fn add_partial(&self, partial: AuthorityPartial) {
        self.insert(partial, None);
    }

    /// Register a partial with its own renderer.
    pub fn add_partial_with_renderer(&self, partial: AuthorityPartial, renderer: Arc<dyn Renderer>) {
        self.insert(partial, Some(renderer));
    }

    fn insert(&self, partial: AuthorityPartial, renderer: Option<Arc<dyn Renderer>>) {
        debug!(partial_id = %partial.id, kind = %partial.kind, "authority partial registered");
        self.partials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                partial.id.clone(),
                Registered {
                    partial: Arc::new(partial),
                    renderer,
                },
            );
    }

    /// Recognise ids shaped `<prefix>[...]` as partials of `kind` without
    /// registering each one.
    pub fn add_dynamic_partials(&self, prefix: &str, kind: &str) {
        self.dynamic
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.to_owned(), kind.to_owned()));
    }

    /// Set the renderer for a partial type.
    pub fn set_renderer(&self, kind: &str, renderer: Arc<dyn Renderer>) {
        self.renderers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.to_owned(), renderer);
    }

    fn resolve(&self, id: &str) -> Option<(Arc<AuthorityPartial>, Option<Arc<dyn Renderer>>)> {
        if let Some(r) = self
            .partials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Some((Arc::clone(&r.partial), r.renderer.clone()));
        }
        let dynamic = self.dynamic.read().unwrap_or_else(|e| e.into_inner());
        dynamic
            .iter()
            .find(|(prefix, _)| crate::partial::bracketed(id, prefix).is_some())
            .map(|(_, kind)| (Arc::new(AuthorityPartial::new(id, kind.as_str())), None))
    }

    fn renderer_for(&self, partial: &AuthorityPartial) -> Option<Arc<dyn Renderer>> {
        self.renderers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partial.kind)
            .cloned()
    }

    /// Answer one batch.
    pub fn process(&self, request: RenderRequest) -> RenderResponse {
        if let Err(code) = self.tokens.validate(&request.auth_token) {
            warn!(code = %code, "render batch rejected");
            return RenderResponse::error(code);
        }
        if request.requests.is_empty() {
            return RenderResponse::error(ErrorCode::MissingPartials);
        }

        let state = PreviewState::new(self.persisted.as_ref(), &request.dirty_settings);
        let contents = request
            .requests
            .iter()
            .map(|(id, contexts)| (id.clone(), self.render_partial(id, contexts, &state)))
            .collect();
        RenderResponse::Contents { contents }
    }

    /// Render one partial once per context; an empty context list renders
    /// once with no context. The output is index-aligned with `contexts`.
    fn render_partial(
        &self,
        id: &str,
        contexts: &[Option<Value>],
        state: &PreviewState<'_>,
    ) -> Vec<RenderedItem> {
        let slots = contexts.len().max(1);
        let Some((partial, own)) = self.resolve(id) else {
            debug!(partial_id = id, "unknown partial requested");
            return vec![RenderedItem::error(ErrorCode::UnknownPartial); slots];
        };
        let Some(renderer) = own.or_else(|| self.renderer_for(&partial)) else {
            error!(partial_id = id, kind = %partial.kind, "no renderer for partial type");
            return vec![RenderedItem::error(ErrorCode::RenderFailed); slots];
        };
        if contexts.is_empty() {
            return vec![self.render_one(&partial, renderer.as_ref(), None, state)];
        }
        contexts
            .iter()
            .map(|context| self.render_one(&partial, renderer.as_ref(), context.as_ref(), state))
            .collect()
    }

    fn render_one(
        &self,
        partial: &AuthorityPartial,
        renderer: &dyn Renderer,
        context: Option<&Value>,
        state: &PreviewState<'_>,
    ) -> RenderedItem {
        let verified;
        let context = match context {
            Some(raw) if renderer.requires_signed_context() => match self.signer.verify(raw) {
                Ok(stripped) => {
                    verified = stripped;
                    Some(&verified)
                }
                Err(code) => {
                    warn!(partial_id = %partial.id, code = %code, "rejected structural context");
                    return RenderedItem::error(code);
                }
            },
            other => other,
        };
        let call = RenderCall {
            partial,
            context,
            state,
        };
        match renderer.render(&call) {
            Ok(content) => RenderedItem {
                content,
                error: None,
            },
            Err(code) => {
                debug!(partial_id = %partial.id, code = %code, "render failed for container");
                RenderedItem::error(code)
            }
        }
    }
}
