//! The preview side of a customization session.
//!
//! A [`PreviewSession`] owns the live document and the partial registry,
//! turns setting changes into refreshes, and talks to the pane over a
//! [`Messenger`]. Rendered batches are applied through [`PreviewHost`],
//! which also discovers partials appearing in newly rendered markup.

use crate::batcher::{BatchHost, RefreshHandle, RenderBatcher};
use crate::config::BatcherConfig;
use crate::dispatch::transport::RenderTransport;
use crate::document::Document;
use crate::error::{RefreshError, Result};
use crate::fallback::{FullRefreshGate, RefreshState};
use crate::messenger::contract::{
    FallbackPayload, FullRefreshPayload, MovedPayload, NoncePayload, RenderedPayload,
    SettingPayload, TransportsPayload,
};
use crate::messenger::{MessageKind, Messenger};
use crate::partial::kinds::LIST_MARKER;
use crate::partial::{
    ChangeAction, ChangeContext, KindTable, Partial, PartialDescriptor, PartialRegistry,
};
use crate::placement::{ATTR_ID, ATTR_SETTINGS, ATTR_TYPE, Placement};
use crate::reconcile::{self, Notice, RenderedPlacement};
use crate::resolver::{DependencyResolver, Resolution};
use crate::settings::{InMemorySettings, SettingEvent, SettingsStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Observable preview activity.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewEvent {
    Rendered {
        partial_id: String,
        context: Option<Value>,
    },
    Moved {
        partial_id: String,
    },
    Fallback {
        partial_id: String,
        error: String,
    },
    FullRefreshRequested {
        reason: String,
    },
}

/// Document, settings and pane channel shared between the session and its
/// batcher.
struct PreviewHost {
    doc: Mutex<Document>,
    settings: Arc<InMemorySettings>,
    registry: Arc<PartialRegistry>,
    messenger: Arc<Messenger>,
    events: broadcast::Sender<PreviewEvent>,
    full_refresh: FullRefreshGate,
}

impl PreviewHost {
    fn doc(&self) -> MutexGuard<'_, Document> {
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the pane for a reload. Only the first request per preview
    /// lifetime goes out.
    fn request_full_refresh(&self, reason: &str) {
        if !self.full_refresh.trigger() {
            debug!(reason, "full refresh already requested");
            return;
        }
        warn!(reason, "requesting full refresh");
        self.messenger.send_json(
            MessageKind::RequestFullRefresh,
            &FullRefreshPayload {
                reason: reason.to_owned(),
            },
        );
        let _ = self.events.send(PreviewEvent::FullRefreshRequested {
            reason: reason.to_owned(),
        });
    }

    fn publish(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::ContentRendered {
                    partial_id,
                    context,
                    ..
                } => {
                    self.messenger.send_json(
                        MessageKind::ContentRendered,
                        &RenderedPayload {
                            partial_id: partial_id.clone(),
                            context: context.clone(),
                        },
                    );
                    let _ = self.events.send(PreviewEvent::Rendered {
                        partial_id,
                        context,
                    });
                }
                Notice::ContentMoved { partial_id, .. } => {
                    self.messenger.send_json(
                        MessageKind::ContentMoved,
                        &MovedPayload {
                            partial_id: partial_id.clone(),
                        },
                    );
                    let _ = self.events.send(PreviewEvent::Moved { partial_id });
                }
            }
        }
    }

    /// Register partials declared in markup that the registry does not know
    /// yet. Returns the newly registered partials.
    fn discover(&self, doc: &Document) -> Vec<Arc<Partial>> {
        let mut found = Vec::new();
        let selector = format!("[{ATTR_ID}]");
        let elements = match doc.select(&selector) {
            Ok(elements) => elements,
            Err(e) => {
                warn!(error = %e, "cannot scan for declared partials");
                Vec::new()
            }
        };
        for el in elements {
            let Some(id) = doc.attr(el, ATTR_ID) else {
                continue;
            };
            if self.registry.contains(id) {
                continue;
            }
            let mut descriptor = PartialDescriptor {
                kind: doc.attr(el, ATTR_TYPE).map(str::to_owned),
                ..PartialDescriptor::default()
            };
            if let Some(raw) = doc.attr(el, ATTR_SETTINGS) {
                match serde_json::from_str::<Vec<String>>(raw) {
                    Ok(settings) => descriptor.settings = settings,
                    Err(e) => warn!(partial_id = id, error = %e, "ignoring malformed settings attribute"),
                }
            }
            self.register_found(id, descriptor, &mut found);
        }

        let before = format!("{LIST_MARKER}_before:");
        for (_, text) in doc.comments() {
            let Some(list_id) = text
                .strip_prefix(before.as_str())
                .and_then(|rest| rest.rsplit_once(':'))
                .map(|(list_id, _)| list_id)
            else {
                continue;
            };
            let id = format!("{LIST_MARKER}[{list_id}]");
            if !self.registry.contains(&id) {
                self.register_found(&id, PartialDescriptor::of_kind(LIST_MARKER), &mut found);
            }
        }
        found
    }

    fn register_found(&self, id: &str, descriptor: PartialDescriptor, found: &mut Vec<Arc<Partial>>) {
        match self.registry.register(id, descriptor) {
            Ok(partial) => {
                debug!(partial_id = id, kind = %partial.kind(), "discovered partial");
                found.push(partial);
            }
            Err(e) => warn!(partial_id = id, error = %e, "cannot register discovered partial"),
        }
    }
}

impl BatchHost for PreviewHost {
    fn placements(&self, partial: &Partial) -> Result<Vec<Placement>> {
        let doc = self.doc();
        partial
            .behavior()
            .placements(partial, &doc, self.settings.as_ref())
    }

    fn dirty_settings(&self) -> BTreeMap<String, Value> {
        self.settings.dirty_values()
    }

    fn apply(&self, partial: &Arc<Partial>, rendered: &[RenderedPlacement]) -> Result<()> {
        let notices = {
            let mut doc = self.doc();
            let notices = reconcile::apply_rendered(&mut doc, partial, rendered)?;
            let nested = self.discover(&doc);
            if !nested.is_empty() {
                debug!(partial_id = partial.id(), nested = nested.len(), "discovered nested partials");
            }
            notices
        };
        self.publish(notices);
        Ok(())
    }

    fn fallback(&self, partial: &Partial, error: &RefreshError) {
        self.messenger.send_json(
            MessageKind::PartialFallback,
            &FallbackPayload {
                partial_id: partial.id().to_owned(),
                error: error.to_string(),
            },
        );
        let _ = self.events.send(PreviewEvent::Fallback {
            partial_id: partial.id().to_owned(),
            error: error.to_string(),
        });
        self.request_full_refresh(&format!("partial {} failed: {error}", partial.id()));
    }
}

/// The preview half of a session.
pub struct PreviewSession {
    host: Arc<PreviewHost>,
    registry: Arc<PartialRegistry>,
    resolver: DependencyResolver,
    batcher: RenderBatcher,
}

impl PreviewSession {
    /// Create a session over `document` with the built-in partial types.
    /// Must be called inside a tokio runtime.
    pub fn new(
        document: Document,
        settings: Arc<InMemorySettings>,
        messenger: Arc<Messenger>,
        transport: Arc<dyn RenderTransport>,
        config: &BatcherConfig,
        auth_token: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_kinds(
            Arc::new(KindTable::with_builtins()),
            document,
            settings,
            messenger,
            transport,
            config,
            auth_token,
        )
    }

    /// Like [`PreviewSession::new`] with a caller-supplied type table.
    #[allow(clippy::too_many_arguments)]
    pub fn with_kinds(
        kinds: Arc<KindTable>,
        document: Document,
        settings: Arc<InMemorySettings>,
        messenger: Arc<Messenger>,
        transport: Arc<dyn RenderTransport>,
        config: &BatcherConfig,
        auth_token: impl Into<String>,
    ) -> Arc<Self> {
        let registry = Arc::new(PartialRegistry::new(kinds));
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        let host = Arc::new(PreviewHost {
            doc: Mutex::new(document),
            settings,
            registry: Arc::clone(&registry),
            messenger,
            events,
            full_refresh: FullRefreshGate::new(),
        });
        let batcher = RenderBatcher::new(
            config.debounce(),
            auth_token,
            transport,
            Arc::clone(&registry),
            Arc::clone(&host) as Arc<dyn BatchHost>,
        );
        Arc::new(Self {
            host,
            resolver: DependencyResolver::new(Arc::clone(&registry)),
            registry,
            batcher,
        })
    }

    /// Discover partials, bind pane messages and announce readiness.
    /// Refreshes queued before this call go out in one batch.
    pub fn start(self: &Arc<Self>) {
        let found = {
            let doc = self.host.doc();
            self.host.discover(&doc)
        };
        info!(partials = found.len(), "preview bootstrapped");

        let messenger = &self.host.messenger;
        let weak = Arc::downgrade(self);
        messenger.bind(MessageKind::Setting, move |payload| {
            let Some(session) = Weak::upgrade(&weak) else {
                return;
            };
            match serde_json::from_value::<SettingPayload>(payload) {
                Ok(setting) => {
                    session.receive_setting(setting);
                }
                Err(e) => warn!(error = %e, "ignoring malformed setting message"),
            }
        });
        let weak = Arc::downgrade(self);
        messenger.bind(MessageKind::NonceRefresh, move |payload| {
            let Some(session) = Weak::upgrade(&weak) else {
                return;
            };
            match serde_json::from_value::<NoncePayload>(payload) {
                Ok(nonce) => {
                    debug!("auth token refreshed");
                    session.batcher.set_auth_token(nonce.auth_token);
                }
                Err(e) => warn!(error = %e, "ignoring malformed nonce message"),
            }
        });
        let weak = Arc::downgrade(self);
        messenger.bind(MessageKind::Saved, move |_| {
            if let Some(session) = Weak::upgrade(&weak) {
                info!("changeset saved; clearing dirty settings");
                session.host.settings.mark_saved();
            }
        });
        let weak = Arc::downgrade(self);
        messenger.bind(MessageKind::RequestTransports, move |_| {
            if let Some(session) = Weak::upgrade(&weak) {
                session
                    .host
                    .messenger
                    .send_json(MessageKind::Transports, &session.transports());
            }
        });

        messenger.send(MessageKind::Ready, Value::Null);
        self.batcher.mark_ready();
    }

    /// Apply a setting update forwarded by the pane.
    pub fn receive_setting(&self, setting: SettingPayload) -> Vec<RefreshHandle> {
        if setting.removed {
            if self.host.settings.remove(&setting.id) {
                return self.handle_setting_event(&SettingEvent::Removed { id: setting.id });
            }
            return Vec::new();
        }
        match self
            .host
            .settings
            .set_with_dirty(setting.id, setting.value, true)
        {
            Some(event) => self.handle_setting_event(&event),
            None => Vec::new(),
        }
    }

    /// Set a dirty value locally and refresh whatever it affects.
    pub fn update_setting(&self, id: &str, value: Value) -> Vec<RefreshHandle> {
        match self.host.settings.set(id, value) {
            Some(event) => self.handle_setting_event(&event),
            None => Vec::new(),
        }
    }

    /// Route one setting event to the partials it affects.
    pub fn handle_setting_event(&self, event: &SettingEvent) -> Vec<RefreshHandle> {
        if let SettingEvent::Removed { id } = event {
            if self.registry.remove(id).is_some() {
                info!(partial_id = %id, "partial removed with its setting");
            }
            return Vec::new();
        }
        let Some(change) = event.to_change() else {
            return Vec::new();
        };

        let partials = match self.resolver.resolve(&change) {
            Resolution::Unrelated => {
                debug!(setting = %change.id, "setting affects no partial");
                return Vec::new();
            }
            Resolution::FullRefresh(reason) => {
                self.host.request_full_refresh(&reason);
                return Vec::new();
            }
            Resolution::Partials(partials) => partials,
        };

        let mut targets: Vec<Arc<Partial>> = Vec::new();
        let mut notices = Vec::new();
        let mut full_refresh = None;
        {
            let mut doc = self.host.doc();
            for partial in &partials {
                let mut ctx = ChangeContext {
                    doc: &mut doc,
                    registry: &self.registry,
                    notices: &mut notices,
                };
                match partial.behavior().on_setting_change(&mut ctx, partial, &change) {
                    ChangeAction::Refresh => targets.push(Arc::clone(partial)),
                    ChangeAction::Delegate(created) => targets.extend(created),
                    ChangeAction::FullRefresh(reason) => {
                        full_refresh = Some(reason);
                        break;
                    }
                }
            }
        }
        self.host.publish(notices);

        if let Some(reason) = full_refresh {
            self.host.request_full_refresh(&reason);
            return Vec::new();
        }
        targets.iter().map(|p| self.batcher.refresh(p)).collect()
    }

    /// Refresh one partial by id.
    pub fn refresh(&self, partial_id: &str) -> Option<RefreshHandle> {
        self.registry.get(partial_id).map(|p| self.batcher.refresh(&p))
    }

    /// Append `html` to the first element matching `parent_selector` and
    /// register the partials it declares, as when a script adds content
    /// after load. Returns the newly registered partials.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Document`] when the selector does not parse
    /// or matches nothing.
    pub fn insert_html(&self, parent_selector: &str, html: &str) -> Result<Vec<Arc<Partial>>> {
        let found = {
            let mut doc = self.host.doc();
            let Some(parent) = doc.select(parent_selector)?.first().copied() else {
                return Err(RefreshError::Document(format!(
                    "no element matches {parent_selector:?}"
                )));
            };
            for node in doc.parse_fragment(html) {
                doc.append_child(parent, node);
            }
            self.host.discover(&doc)
        };
        if !found.is_empty() {
            info!(parent = parent_selector, partials = found.len(), "registered inserted partials");
        }
        Ok(found)
    }

    /// Register a partial explicitly, as a theme or plugin would.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the id is illegal for its type.
    pub fn register_partial(&self, id: &str, descriptor: PartialDescriptor) -> Result<Arc<Partial>> {
        self.registry.register(id, descriptor)
    }

    /// Per-setting transport advertisement for every known setting.
    pub fn transports(&self) -> TransportsPayload {
        let mut ids = self.host.settings.ids();
        self.registry.for_each(|p| ids.extend(p.settings()));
        ids.into_iter()
            .map(|id| {
                let mode = self.resolver.transport_for(&id);
                (id, mode)
            })
            .collect()
    }

    pub fn registry(&self) -> &Arc<PartialRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Arc<InMemorySettings> {
        &self.host.settings
    }

    pub fn refresh_state(&self, partial_id: &str) -> RefreshState {
        self.batcher.state(partial_id)
    }

    /// Render batches sent so far.
    pub fn round_trips(&self) -> u64 {
        self.batcher.round_trips()
    }

    pub fn full_refresh_requested(&self) -> bool {
        self.host.full_refresh.is_triggered()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreviewEvent> {
        self.host.events.subscribe()
    }

    /// Run `f` against the live document.
    pub fn with_document<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.host.doc())
    }

    /// Serialized live document.
    pub fn html(&self) -> String {
        self.with_document(Document::to_html)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::authority::{AuthorityPartial, RenderAuthority, TemplateRenderer, TokenRegistry};
    use crate::dispatch::transport::LocalTransport;
    use crate::error::ErrorCode;
    use crate::resolver::TransportMode;
    use crate::signature::ContextSigner;
    use serde_json::json;

    struct Setup {
        session: Arc<PreviewSession>,
        pane: Messenger,
    }

    fn setup(html: &str) -> Setup {
        let tokens = TokenRegistry::new();
        let token = tokens.issue(true);
        let persisted = Arc::new(InMemorySettings::with_values([("title", json!("Old"))]));
        let authority = Arc::new(RenderAuthority::new(
            Arc::new(tokens),
            ContextSigner::new(b"secret"),
            persisted,
        ));
        authority.add_partial_with_renderer(
            AuthorityPartial::new("header", "default").with_settings(["title"]),
            Arc::new(TemplateRenderer::new("<h1>{{ title }}</h1>")),
        );
        authority.add_partial_with_renderer(
            AuthorityPartial::new("footer", "default").with_settings(["title"]),
            Arc::new(TemplateRenderer::new("<small>{{ title }}</small>")),
        );

        let (pane, preview) = Messenger::pair();
        let settings = Arc::new(InMemorySettings::with_values([("title", json!("Old"))]));
        let session = PreviewSession::new(
            Document::parse(html),
            settings,
            Arc::new(preview),
            Arc::new(LocalTransport::new(authority)),
            &BatcherConfig { debounce_ms: 50 },
            token,
        );
        Setup { session, pane }
    }

    const PAGE: &str = r#"<div id="site-title" data-partial-id="header" data-partial-settings='["title"]'><h1>Old</h1></div>"#;

    #[tokio::test]
    async fn discovers_partials_and_refreshes_on_change() {
        let s = setup(PAGE);
        s.session.start();
        assert!(s.session.registry().contains("header"));

        let handles = s.session.update_setting("title", json!("Hello"));
        assert_eq!(handles.len(), 1);
        for h in handles {
            h.await.unwrap();
        }
        assert!(s.session.html().contains("<h1>Hello</h1>"));
        assert_eq!(s.session.refresh_state("header"), RefreshState::Applied);
        drop(s.pane);
    }

    #[tokio::test]
    async fn advertises_selective_transport_for_related_settings() {
        let s = setup(PAGE);
        s.session.start();
        let transports = s.session.transports();
        assert_eq!(transports["title"], TransportMode::Selective);
        s.session.settings().set("footer_text", json!("x"));
        assert_eq!(s.session.transports()["footer_text"], TransportMode::Refresh);
    }

    #[tokio::test]
    async fn unrelated_settings_do_nothing() {
        let s = setup(PAGE);
        s.session.start();
        assert!(s.session.update_setting("tagline", json!("x")).is_empty());
        assert!(!s.session.full_refresh_requested());
    }

    #[tokio::test]
    async fn claimed_setting_without_partial_requests_full_refresh() {
        let s = setup(PAGE);
        s.session.start();
        let mut events = s.session.subscribe();
        assert!(s.session.update_setting("list[footer]", json!(["a"])).is_empty());
        assert!(s.session.full_refresh_requested());
        assert!(matches!(
            events.recv().await.unwrap(),
            PreviewEvent::FullRefreshRequested { .. }
        ));
    }

    #[tokio::test]
    async fn removed_setting_unregisters_its_partial() {
        let s = setup(PAGE);
        s.session.start();
        s.session.handle_setting_event(&SettingEvent::Removed {
            id: "header".to_owned(),
        });
        assert!(!s.session.registry().contains("header"));
    }

    #[tokio::test]
    async fn combinator_selectors_locate_their_containers() {
        let s = setup(r#"<header id="masthead"><h1 class="site-title">Old</h1></header>"#);
        s.session
            .register_partial(
                "header",
                PartialDescriptor::default()
                    .with_selector("#masthead .site-title")
                    .with_settings(["title"]),
            )
            .unwrap();
        s.session.start();
        for h in s.session.update_setting("title", json!("Hello")) {
            h.await.unwrap();
        }
        let text = s.session.with_document(|doc| {
            let el = doc.select("#masthead .site-title").unwrap()[0];
            doc.text_content(el)
        });
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn unparsable_selector_fails_through_fallback() {
        let s = setup("<p>Old</p>");
        s.session
            .register_partial(
                "header",
                PartialDescriptor::default().with_selector("p[[").with_settings(["title"]),
            )
            .unwrap();
        s.session.start();
        let handles = s.session.update_setting("title", json!("Hello"));
        assert_eq!(handles.len(), 1);
        for h in handles {
            assert!(matches!(h.await, Err(RefreshError::Document(_))));
        }
        assert!(s.session.full_refresh_requested());
        assert_eq!(s.session.refresh_state("header"), RefreshState::Failed);
        assert_eq!(s.session.round_trips(), 0);
    }

    #[tokio::test]
    async fn inserted_markup_registers_partials_that_later_refresh() {
        let s = setup(&format!("{PAGE}<main></main>"));
        s.session.start();
        let found = s
            .session
            .insert_html(
                "main",
                r#"<div data-partial-id="footer" data-partial-settings='["title"]'><small>Old</small></div>"#,
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "footer");

        let handles = s.session.update_setting("title", json!("Hello"));
        assert_eq!(handles.len(), 2);
        for h in handles {
            h.await.unwrap();
        }
        let html = s.session.html();
        assert!(html.contains("<main><div"));
        assert!(html.contains("<small>Hello</small>"));
        assert!(matches!(
            s.session.insert_html("aside", "<p></p>"),
            Err(RefreshError::Document(_))
        ));
    }

    #[tokio::test]
    async fn pane_notices_refresh_the_token_and_clear_dirty_settings() {
        let s = setup(PAGE);
        s.session.start();
        let _pending = s.session.update_setting("title", json!("Hello"));
        assert!(!s.session.settings().dirty_values().is_empty());

        s.pane.send(MessageKind::Saved, Value::Null);
        s.pane.send_json(
            MessageKind::NonceRefresh,
            &NoncePayload {
                auth_token: "revoked".to_owned(),
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(s.session.settings().dirty_values().is_empty());

        let handle = s.session.refresh("header").unwrap();
        assert!(matches!(handle.await, Err(RefreshError::Auth(ErrorCode::BadNonce))));
    }

    #[tokio::test]
    async fn list_markers_register_list_partials() {
        let s = setup("<ul><!--list_before:side:1--><!--list_after:side:1--></ul>");
        s.session.start();
        let list = s.session.registry().get("list[side]").unwrap();
        assert_eq!(list.kind(), "list");
    }
}
