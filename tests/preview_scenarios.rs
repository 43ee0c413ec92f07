//! End-to-end preview scenarios: pane, preview and authority wired together.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use partial_refresh::authority::{
    AuthorityPartial, CallbackRenderer, ListMemberRenderer, PageEmitter, RenderCall,
    RenderOutcome, TemplateRenderer, TokenRegistry,
};
use partial_refresh::config::BatcherConfig;
use partial_refresh::dispatch::{
    LocalTransport, MessengerTransport, RenderRequest, RenderResponse, RenderTransport,
};
use partial_refresh::document::Document;
use partial_refresh::messenger::run_line_bridge;
use partial_refresh::pane::PreviewReloader;
use partial_refresh::partial::bracketed;
use partial_refresh::partial::kinds::LIST_MARKER;
use partial_refresh::placement::{self, ATTR_CONTEXT};
use partial_refresh::reconcile::list::member_containers;
use partial_refresh::{
    ContextSigner, ErrorCode, InMemorySettings, Messenger, PaneSession, PreviewEvent,
    PreviewSession, RefreshError, RenderAuthority, TransportMode,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SECRET: &[u8] = b"test signing secret";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Recording {
    inner: LocalTransport,
    seen: Mutex<Vec<RenderRequest>>,
}

impl Recording {
    fn new(authority: Arc<RenderAuthority>) -> Self {
        Self {
            inner: LocalTransport::new(authority),
            seen: Mutex::default(),
        }
    }

    fn requests(&self) -> Vec<RenderRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl RenderTransport for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, request: RenderRequest) -> partial_refresh::Result<RenderResponse> {
        self.seen.lock().unwrap().push(request.clone());
        self.inner.send(request).await
    }
}

#[derive(Default)]
struct CountingReloader {
    reloads: Mutex<Vec<String>>,
}

impl CountingReloader {
    fn count(&self) -> usize {
        self.reloads.lock().unwrap().len()
    }
}

impl PreviewReloader for CountingReloader {
    fn reload(&self, reason: &str) {
        self.reloads.lock().unwrap().push(reason.to_owned());
    }
}

fn authority(tokens: TokenRegistry) -> Arc<RenderAuthority> {
    let persisted = Arc::new(InMemorySettings::with_values([
        ("title", json!("Old")),
        ("tagline", json!("Just another site")),
    ]));
    let authority = Arc::new(RenderAuthority::new(
        Arc::new(tokens),
        ContextSigner::new(SECRET),
        persisted,
    ));
    authority.add_partial_with_renderer(
        AuthorityPartial::new("header", "default").with_settings(["title"]),
        Arc::new(TemplateRenderer::new("<h1>{{ title }}</h1>")),
    );
    authority.add_partial_with_renderer(
        AuthorityPartial::new("tagline", "default"),
        Arc::new(TemplateRenderer::new("<p>{{ tagline }}</p>")),
    );
    authority
}

fn config() -> BatcherConfig {
    BatcherConfig { debounce_ms: 100 }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

const HEADER_PAGE: &str = r#"<html><body>
<div id="site-title" data-partial-id="header" data-partial-settings='["title"]'><h1>Old</h1></div>
<div id="tagline" data-partial-id="tagline"><p>Just another site</p></div>
</body></html>"#;

// ---------------------------------------------------------------------------
// Header scenario across a process boundary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn title_change_refreshes_header_through_pane_relay() {
    let tokens = TokenRegistry::new();
    let token = tokens.issue(true);
    let recording = Arc::new(Recording::new(authority(tokens)));

    // Pane and preview each hold one end of their own pair and talk over a
    // byte stream, as separate processes would.
    let (pane_end, pane_wire) = Messenger::pair();
    let (preview_wire, preview_end) = Messenger::pair();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    tokio::spawn(run_line_bridge(pane_wire, a_read, a_write, 256));
    tokio::spawn(run_line_bridge(preview_wire, b_read, b_write, 256));

    let reloader = Arc::new(CountingReloader::default());
    let pane = PaneSession::new(
        Arc::new(pane_end),
        Arc::clone(&reloader) as Arc<dyn PreviewReloader>,
        Arc::clone(&recording) as Arc<dyn RenderTransport>,
    );
    let pane_settings = InMemorySettings::with_values([("title", json!("Old"))]);
    let _watcher = pane.watch_settings(&pane_settings);

    let preview_end = Arc::new(preview_end);
    let preview = PreviewSession::new(
        Document::parse(HEADER_PAGE),
        Arc::new(InMemorySettings::with_values([("title", json!("Old"))])),
        Arc::clone(&preview_end),
        Arc::new(MessengerTransport::new(Arc::clone(&preview_end))),
        &config(),
        token,
    );
    let mut events = preview.subscribe();
    preview.start();

    pane.wait_ready().await;
    eventually(|| pane.transport_for("title") == TransportMode::Selective).await;

    pane_settings.set("title", json!("Hello"));

    let rendered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let PreviewEvent::Rendered { partial_id, .. } = events.recv().await.unwrap() {
                return partial_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(rendered, "header");

    let requests = recording.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].requests,
        BTreeMap::from([("header".to_owned(), vec![None])])
    );
    assert_eq!(requests[0].dirty_settings["title"], json!("Hello"));

    preview.with_document(|doc| {
        let el = doc.select("#site-title").unwrap()[0];
        assert_eq!(doc.inner_html(el), "<h1>Hello</h1>");
        let tagline = doc.select("#tagline").unwrap()[0];
        assert_eq!(doc.inner_html(tagline), "<p>Just another site</p>");
    });
    assert_eq!(reloader.count(), 0);
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

fn list_page() -> String {
    let mut page = PageEmitter::new(ContextSigner::new(SECRET));
    let mut html = String::from("<html><body>");
    for class in ["sidebar", "footer"] {
        html.push_str(&format!("<ul class=\"{class}\">"));
        html.push_str(&page.list_start("side"));
        let context = page.member_context("side");
        for member in ["a", "b", "c"] {
            html.push_str(&format!(
                "<li{}>{}</li>",
                PageEmitter::placement_attrs(
                    &format!("list_item[{member}]"),
                    Some("list_item"),
                    Some(&context)
                ),
                member.to_uppercase()
            ));
        }
        html.push_str(&page.list_end("side"));
        html.push_str("</ul>");
    }
    html.push_str("</body></html>");
    html
}

fn list_authority(tokens: TokenRegistry) -> Arc<RenderAuthority> {
    let authority = authority(tokens);
    authority.add_dynamic_partials("list_item", "list_item");
    let member = CallbackRenderer::new(|call: &RenderCall<'_>| -> RenderOutcome {
        let member = bracketed(&call.partial.id, "list_item").unwrap_or_default();
        let instance = call
            .context
            .and_then(|c| c.get("instance_number"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(Some(format!(
            "<li class=\"member\" data-instance=\"{instance}\">{}</li>",
            member.to_uppercase()
        )))
    });
    authority.set_renderer("list_item", Arc::new(ListMemberRenderer::new(Arc::new(member))));
    authority
}

fn region_members(preview: &PreviewSession) -> Vec<Vec<String>> {
    preview.with_document(|doc| {
        placement::marker_pairs(doc, LIST_MARKER, "side")
            .iter()
            .map(|region| {
                member_containers(doc, region)
                    .into_iter()
                    .map(|(member, _)| member)
                    .collect()
            })
            .collect()
    })
}

#[tokio::test]
async fn each_list_instance_follows_the_new_member_order() {
    let tokens = TokenRegistry::new();
    let token = tokens.issue(true);
    let (_pane, preview_end) = Messenger::pair();
    let settings = Arc::new(InMemorySettings::with_values([(
        "list[side]",
        json!(["a", "b", "c"]),
    )]));
    let preview = PreviewSession::new(
        Document::parse(&list_page()),
        settings,
        Arc::new(preview_end),
        Arc::new(LocalTransport::new(list_authority(tokens))),
        &config(),
        token,
    );
    preview.start();
    assert!(preview.registry().contains("list[side]"));
    assert!(preview.registry().contains("list_item[b]"));

    let handles = preview.update_setting("list[side]", json!(["c", "a", "d"]));
    assert_eq!(handles.len(), 1, "only the new member needs rendering");
    for handle in handles {
        let rendered = handle.await.unwrap();
        assert_eq!(rendered.len(), 2, "one render per list instance");
    }

    let regions = region_members(&preview);
    assert_eq!(regions.len(), 2);
    for members in &regions {
        assert_eq!(members, &vec!["c", "a", "d"]);
    }

    // The new member was rendered once per instance with that instance's
    // context.
    preview.with_document(|doc| {
        let rendered = doc.select("li.member").unwrap();
        let instances: Vec<_> = rendered
            .iter()
            .map(|el| doc.attr(*el, "data-instance").unwrap().to_owned())
            .collect();
        assert_eq!(instances, vec!["1", "2"]);
        for el in rendered {
            assert_eq!(doc.text_content(el), "D");
            let context: Value =
                serde_json::from_str(doc.attr(el, ATTR_CONTEXT).unwrap()).unwrap();
            assert_eq!(context["list_id"], "side");
        }
    });
    assert!(!preview.full_refresh_requested());
}

#[tokio::test]
async fn emptying_a_list_reloads_instead_of_patching() {
    let tokens = TokenRegistry::new();
    let token = tokens.issue(true);
    let (_pane, preview_end) = Messenger::pair();
    let preview = PreviewSession::new(
        Document::parse(&list_page()),
        Arc::new(InMemorySettings::with_values([("list[side]", json!(["a", "b", "c"]))])),
        Arc::new(preview_end),
        Arc::new(LocalTransport::new(list_authority(tokens))),
        &config(),
        token,
    );
    preview.start();
    assert!(preview.update_setting("list[side]", json!([])).is_empty());
    assert!(preview.full_refresh_requested());
    assert_eq!(region_members(&preview)[0], vec!["a", "b", "c"]);
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bad_nonce_rejects_every_partial_and_reloads_once() {
    let (pane_end, preview_end) = Messenger::pair();
    let reloader = Arc::new(CountingReloader::default());
    let local = Arc::new(LocalTransport::new(authority(TokenRegistry::new())));
    let _pane = PaneSession::new(
        Arc::new(pane_end),
        Arc::clone(&reloader) as Arc<dyn PreviewReloader>,
        Arc::clone(&local) as Arc<dyn RenderTransport>,
    );
    let preview = PreviewSession::new(
        Document::parse(HEADER_PAGE),
        Arc::new(InMemorySettings::new()),
        Arc::new(preview_end),
        local,
        &config(),
        "stale-token",
    );
    preview.start();

    let mut handles = preview.update_setting("title", json!("Hello"));
    handles.extend(preview.update_setting("tagline", json!("New tagline")));
    assert_eq!(handles.len(), 2);
    for handle in handles {
        assert!(matches!(
            handle.await,
            Err(RefreshError::Auth(ErrorCode::BadNonce))
        ));
    }
    eventually(|| reloader.count() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reloader.count(), 1);
    assert_eq!(preview.round_trips(), 1);
}

#[tokio::test]
async fn partials_without_fallback_leave_recovery_to_the_caller() {
    let (_pane, preview_end) = Messenger::pair();
    let preview = PreviewSession::new(
        Document::parse(r#"<div id="widget">x</div>"#),
        Arc::new(InMemorySettings::new()),
        Arc::new(preview_end),
        Arc::new(LocalTransport::new(authority(TokenRegistry::new()))),
        &config(),
        "stale-token",
    );
    preview
        .register_partial(
            "widget",
            partial_refresh::PartialDescriptor::default()
                .with_selector("#widget")
                .without_fallback(),
        )
        .unwrap();
    preview.start();
    let handle = preview.refresh("widget").unwrap();
    assert!(handle.await.is_err());
    assert!(!preview.full_refresh_requested());
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn changes_within_one_window_share_a_round_trip() {
    let tokens = TokenRegistry::new();
    let token = tokens.issue(true);
    let recording = Arc::new(Recording::new(authority(tokens)));
    let (_pane, preview_end) = Messenger::pair();
    let preview = PreviewSession::new(
        Document::parse(HEADER_PAGE),
        Arc::new(InMemorySettings::new()),
        Arc::new(preview_end),
        Arc::clone(&recording) as Arc<dyn RenderTransport>,
        &config(),
        token,
    );
    preview.start();

    let mut handles = Vec::new();
    for (i, title) in ["H", "He", "Hel", "Hell", "Hello"].iter().enumerate() {
        handles.extend(preview.update_setting("title", json!(title)));
        if i == 2 {
            handles.extend(preview.update_setting("tagline", json!("Tag")));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let requests = recording.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].requests.len(), 2);
    assert_eq!(requests[0].dirty_settings["title"], json!("Hello"));
    assert!(preview.html().contains("<h1>Hello</h1>"));
    assert!(preview.html().contains("<p>Tag</p>"));
}

#[tokio::test(start_paused = true)]
async fn refreshes_before_ready_go_out_once_ready() {
    let tokens = TokenRegistry::new();
    let token = tokens.issue(true);
    let recording = Arc::new(Recording::new(authority(tokens)));
    let (_pane, preview_end) = Messenger::pair();
    let preview = PreviewSession::new(
        Document::parse(HEADER_PAGE),
        Arc::new(InMemorySettings::new()),
        Arc::new(preview_end),
        Arc::clone(&recording) as Arc<dyn RenderTransport>,
        &config(),
        token,
    );
    preview
        .register_partial(
            "header",
            partial_refresh::PartialDescriptor::default()
                .with_selector("#site-title")
                .with_settings(["title"]),
        )
        .unwrap();
    let handles = preview.update_setting("title", json!("Early"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(recording.requests().is_empty());

    preview.start();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(recording.requests().len(), 1);
    assert!(preview.html().contains("<h1>Early</h1>"));
}

// ---------------------------------------------------------------------------
// Signed menu contexts
// ---------------------------------------------------------------------------

fn menu_page(signer: &ContextSigner) -> String {
    let page = PageEmitter::new(signer.clone());
    format!(
        "<nav{}><ul><li>Home</li></ul></nav><nav{}><ul><li>Shop</li></ul></nav>",
        page.menu_container_attrs(3, &json!({"location": "primary", "depth": 1})),
        page.menu_container_attrs(4, &json!({"location": "footer", "depth": 1})),
    )
}

#[tokio::test]
async fn menu_item_change_rerenders_only_its_menu_with_verified_context() {
    let tokens = TokenRegistry::new();
    let token = tokens.issue(true);
    let authority = authority(tokens);
    authority.add_dynamic_partials("menu", "menu");
    let menu = CallbackRenderer::new(|call: &RenderCall<'_>| -> RenderOutcome {
        let context = call.context.ok_or(ErrorCode::MissingContainer)?;
        let label = call
            .state
            .get("menu_item[11]")
            .and_then(|v| v.get("title").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_default();
        Ok(Some(format!(
            "<ul data-location=\"{}\"><li>{label}</li></ul>",
            context["location"].as_str().unwrap_or_default()
        )))
    })
    .signed();
    authority.set_renderer("menu", Arc::new(menu));

    let signer = ContextSigner::new(SECRET);
    let (_pane, preview_end) = Messenger::pair();
    let preview = PreviewSession::new(
        Document::parse(&menu_page(&signer)),
        Arc::new(InMemorySettings::new()),
        Arc::new(preview_end),
        Arc::new(LocalTransport::new(authority)),
        &config(),
        token,
    );
    preview.start();
    assert!(preview.registry().contains("menu[3]"));
    assert!(preview.registry().contains("menu[4]"));

    let handles = preview.update_setting("menu_item[11]", json!({"menu_id": 3, "title": "About"}));
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await.unwrap();
    }
    let html = preview.html();
    assert!(html.contains(r#"<ul data-location="primary"><li>About</li></ul>"#));
    assert!(html.contains("<li>Shop</li>"));
}
