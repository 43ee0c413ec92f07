//! Debounced, cancellable batching of partial refreshes.
//!
//! Every refresh requested within one debounce window shares a single round
//! trip. When the window closes, any still-outstanding earlier round trip is
//! cancelled; its callers are re-attached to the new batch if their partial
//! is still registered. Placements and dirty settings are snapshotted at
//! dispatch time, not at request time.
//!
//! Lock order: the batcher's state lock may be held while calling
//! [`BatchHost::placements`] and [`BatchHost::dirty_settings`]; hosts must
//! not call back into the batcher from those.

use crate::dispatch::transport::RenderTransport;
use crate::dispatch::wire::{RenderRequest, RenderResponse, RenderedItem};
use crate::error::{ErrorCode, RefreshError, Result};
use crate::fallback::RefreshState;
use crate::partial::{Partial, PartialRegistry};
use crate::placement::Placement;
use crate::reconcile::RenderedPlacement;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result delivered to each refresh caller.
pub type RefreshOutcome = Result<Vec<RenderedPlacement>>;

/// The preview-side collaborator the batcher reads from and applies into.
pub trait BatchHost: Send + Sync {
    /// Current placements of a partial. An error fails that partial's
    /// refresh through the fallback policy.
    fn placements(&self, partial: &Partial) -> Result<Vec<Placement>>;

    /// Atomic snapshot of every dirty setting.
    fn dirty_settings(&self) -> BTreeMap<String, Value>;

    /// Apply one partial's rendered placements to the document.
    fn apply(&self, partial: &Arc<Partial>, rendered: &[RenderedPlacement]) -> Result<()>;

    /// Run the fallback policy after a failed refresh.
    fn fallback(&self, partial: &Partial, error: &RefreshError);
}

/// Pending result of one `refresh` call. Resolves once; a dropped batch
/// without re-attachment resolves to [`RefreshError::Cancelled`].
pub struct RefreshHandle {
    partial_id: String,
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl RefreshHandle {
    pub fn partial_id(&self) -> &str {
        &self.partial_id
    }
}

impl Future for RefreshHandle {
    type Output = RefreshOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RefreshError::Cancelled)))
    }
}

type Waiter = oneshot::Sender<RefreshOutcome>;

struct Entry {
    partial: Arc<Partial>,
    waiters: Vec<Waiter>,
}

struct InFlight {
    batch: u64,
    cancel: CancellationToken,
    entries: BTreeMap<u64, Entry>,
    placements: BTreeMap<u64, Vec<Placement>>,
}

#[derive(Default)]
struct State {
    ready: bool,
    /// Keyed by registration sequence, so batches apply in registration order.
    pending: BTreeMap<u64, Entry>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    next_batch: u64,
    in_flight: Option<InFlight>,
    states: HashMap<String, RefreshState>,
}

struct Inner {
    debounce: Duration,
    transport: Arc<dyn RenderTransport>,
    registry: Arc<PartialRegistry>,
    host: Arc<dyn BatchHost>,
    auth_token: RwLock<String>,
    state: Mutex<State>,
    round_trips: AtomicU64,
}

/// Coalesces refreshes into debounced render batches.
pub struct RenderBatcher {
    inner: Arc<Inner>,
}

impl RenderBatcher {
    /// Create a batcher. Partials removed from `registry` have their queued
    /// or in-flight refreshes cancelled.
    pub fn new(
        debounce: Duration,
        auth_token: impl Into<String>,
        transport: Arc<dyn RenderTransport>,
        registry: Arc<PartialRegistry>,
        host: Arc<dyn BatchHost>,
    ) -> Self {
        let inner = Arc::new(Inner {
            debounce,
            transport,
            registry: Arc::clone(&registry),
            host,
            auth_token: RwLock::new(auth_token.into()),
            state: Mutex::new(State::default()),
            round_trips: AtomicU64::new(0),
        });
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        registry.on_remove(Arc::new(move |id: &str| {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_partial(id);
            }
        }));
        Self { inner }
    }

    /// Request a refresh of `partial`. Requests for a partial already
    /// waiting in the current window share that window's result, and every
    /// request restarts the window. A partial whose earlier round trip is
    /// still in flight gets a new pending entry; that round trip is
    /// superseded when the window closes.
    pub fn refresh(&self, partial: &Arc<Partial>) -> RefreshHandle {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        state
            .states
            .insert(partial.id().to_owned(), RefreshState::PendingRefresh);
        match state.pending.get_mut(&partial.seq()) {
            Some(entry) => {
                debug!(partial_id = partial.id(), "refresh already pending; sharing result");
                entry.waiters.push(tx);
                if state.ready {
                    Inner::restart_timer(&self.inner, &mut state, self.inner.debounce);
                }
            }
            None => {
                state.pending.insert(
                    partial.seq(),
                    Entry {
                        partial: Arc::clone(partial),
                        waiters: vec![tx],
                    },
                );
                if state.ready {
                    Inner::restart_timer(&self.inner, &mut state, self.inner.debounce);
                }
            }
        }
        RefreshHandle {
            partial_id: partial.id().to_owned(),
            rx,
        }
    }

    /// Open the readiness gate. Refreshes queued before now go out in one
    /// batch, in registration order.
    pub fn mark_ready(&self) {
        let mut state = self.inner.lock();
        if state.ready {
            return;
        }
        state.ready = true;
        if !state.pending.is_empty() {
            info!(queued = state.pending.len(), "preview ready; flushing queued refreshes");
            Inner::restart_timer(&self.inner, &mut state, Duration::ZERO);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Replace the auth token attached to future batches.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self
            .inner
            .auth_token
            .write()
            .unwrap_or_else(|e| e.into_inner()) = token.into();
    }

    /// Lifecycle state of the partial's latest refresh cycle.
    pub fn state(&self, partial_id: &str) -> RefreshState {
        self.inner
            .lock()
            .states
            .get(partial_id)
            .copied()
            .unwrap_or_default()
    }

    /// Round trips dispatched so far.
    pub fn round_trips(&self) -> u64 {
        self.inner.round_trips.load(Ordering::Relaxed)
    }

    /// Stop the timer and cancel everything queued or in flight.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(flight) = state.in_flight.take() {
            flight.cancel.cancel();
        }
        // Dropping the senders resolves every handle as cancelled.
        state.pending.clear();
    }
}

impl Drop for RenderBatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn restart_timer(inner: &Arc<Self>, state: &mut State, delay: Duration) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::dispatch(&inner, generation).await;
        }));
    }

    fn is_current(&self, partial: &Arc<Partial>) -> bool {
        self.registry
            .get(partial.id())
            .is_some_and(|p| Arc::ptr_eq(&p, partial))
    }

    async fn dispatch(inner: &Arc<Self>, generation: u64) {
        let mut unaddressable = Vec::new();
        let prepared = {
            let mut state = inner.lock();
            if state.generation != generation || !state.ready {
                return;
            }
            state.timer = None;
            let mut entries = std::mem::take(&mut state.pending);

            if let Some(previous) = state.in_flight.take() {
                debug!(batch = previous.batch, "superseding outstanding render batch");
                previous.cancel.cancel();
                for (seq, entry) in previous.entries {
                    if inner.is_current(&entry.partial) {
                        entries
                            .entry(seq)
                            .or_insert_with(|| Entry {
                                partial: Arc::clone(&entry.partial),
                                waiters: Vec::new(),
                            })
                            .waiters
                            .extend(entry.waiters);
                    } else {
                        for waiter in entry.waiters {
                            let _ = waiter.send(Err(RefreshError::Cancelled));
                        }
                    }
                }
            }
            let mut requests = BTreeMap::new();
            let mut placements = BTreeMap::new();
            for (seq, entry) in std::mem::take(&mut entries) {
                let found = match inner.host.placements(&entry.partial) {
                    Ok(found) => found,
                    Err(error) => {
                        unaddressable.push((entry, error));
                        continue;
                    }
                };
                requests.insert(
                    entry.partial.id().to_owned(),
                    found.iter().map(|p| p.context.clone()).collect::<Vec<_>>(),
                );
                placements.insert(seq, found);
                state
                    .states
                    .insert(entry.partial.id().to_owned(), RefreshState::InFlight);
                entries.insert(seq, entry);
            }
            if entries.is_empty() {
                None
            } else {
                let request = RenderRequest {
                    auth_token: inner
                        .auth_token
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone(),
                    dirty_settings: inner.host.dirty_settings(),
                    requests,
                };

                state.next_batch += 1;
                let batch = state.next_batch;
                let cancel = CancellationToken::new();
                state.in_flight = Some(InFlight {
                    batch,
                    cancel: cancel.clone(),
                    entries,
                    placements,
                });
                Some((batch, request, cancel))
            }
        };

        for (entry, error) in unaddressable {
            warn!(partial_id = entry.partial.id(), error = %error, "cannot locate partial placements");
            inner.settle(entry, Err(error));
        }
        let Some((batch, request, cancel)) = prepared else {
            return;
        };

        inner.round_trips.fetch_add(1, Ordering::Relaxed);
        debug!(
            batch,
            partials = request.requests.len(),
            transport = inner.transport.name(),
            "dispatching render batch"
        );
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                debug!(batch, "render batch cancelled");
                return;
            }
            outcome = inner.transport.send(request) => outcome,
        };
        inner.complete(batch, outcome);
    }

    fn complete(&self, batch: u64, outcome: Result<RenderResponse>) {
        let flight = {
            let mut state = self.lock();
            let current = state.in_flight.as_ref().is_some_and(|f| f.batch == batch);
            if current { state.in_flight.take() } else { None }
        };
        let Some(mut flight) = flight else {
            debug!(batch, "dropping response for a cancelled batch");
            return;
        };

        match outcome {
            Err(error) => {
                warn!(batch, error = %error, "render batch failed");
                for entry in flight.entries.into_values() {
                    self.settle(entry, Err(error.clone()));
                }
            }
            Ok(RenderResponse::Error { error }) => {
                warn!(batch, code = %error, "render batch rejected by authority");
                for entry in flight.entries.into_values() {
                    let err = RefreshError::from_code(entry.partial.id(), error);
                    self.settle(entry, Err(err));
                }
            }
            Ok(RenderResponse::Contents { mut contents }) => {
                for (seq, entry) in flight.entries {
                    let placements = flight.placements.remove(&seq).unwrap_or_default();
                    let items = contents.remove(entry.partial.id());
                    let result = pair_items(entry.partial.id(), placements, items).and_then(|rendered| {
                        if !self.is_current(&entry.partial) {
                            return Err(RefreshError::Cancelled);
                        }
                        self.host.apply(&entry.partial, &rendered)?;
                        Ok(rendered)
                    });
                    self.settle(entry, result);
                }
            }
        }
    }

    fn settle(&self, entry: Entry, result: RefreshOutcome) {
        let id = entry.partial.id();
        let state = if result.is_ok() {
            RefreshState::Applied
        } else {
            RefreshState::Failed
        };
        self.lock().states.insert(id.to_owned(), state);

        if let Err(error) = &result {
            if error.is_cancelled() {
                debug!(partial_id = id, "refresh cancelled");
            } else if entry.partial.fallback_refresh() {
                warn!(partial_id = id, error = %error, "partial refresh failed; falling back");
                self.host.fallback(&entry.partial, error);
            } else {
                debug!(partial_id = id, error = %error, "partial refresh failed; caller recovers");
            }
        }
        for waiter in entry.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn cancel_partial(&self, id: &str) {
        let mut state = self.lock();
        let mut dropped = Vec::new();
        state.pending.retain(|_, entry| {
            let keep = entry.partial.id() != id;
            if !keep {
                dropped.append(&mut entry.waiters);
            }
            keep
        });
        if let Some(flight) = state.in_flight.as_mut() {
            flight.entries.retain(|_, entry| {
                let keep = entry.partial.id() != id;
                if !keep {
                    dropped.append(&mut entry.waiters);
                }
                keep
            });
        }
        state.states.remove(id);
        drop(state);
        if !dropped.is_empty() {
            debug!(partial_id = id, waiters = dropped.len(), "cancelled refresh of removed partial");
        }
        for waiter in dropped {
            let _ = waiter.send(Err(RefreshError::Cancelled));
        }
    }
}

/// Pair response items with the placements they were requested for.
fn pair_items(
    partial_id: &str,
    placements: Vec<Placement>,
    items: Option<Vec<RenderedItem>>,
) -> Result<Vec<RenderedPlacement>> {
    let items = items.ok_or_else(|| {
        RefreshError::Validation(format!("response has no entry for partial {partial_id}"))
    })?;
    if items.iter().any(|i| i.error == Some(ErrorCode::UnknownPartial)) {
        return Err(RefreshError::UnknownPartial(partial_id.to_owned()));
    }
    if placements.is_empty() {
        // Rendered once with no context; nothing on the page to update.
        return Ok(Vec::new());
    }
    if items.len() != placements.len() {
        return Err(RefreshError::Validation(format!(
            "partial {partial_id}: {} items for {} placements",
            items.len(),
            placements.len()
        )));
    }
    Ok(placements
        .into_iter()
        .zip(items)
        .map(|(placement, item)| RenderedPlacement {
            placement,
            content: item.content,
            error: item.error,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::document::{Document, NodeId};
    use crate::partial::{KindTable, PartialDescriptor};
    use crate::placement::Anchor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const WINDOW: Duration = Duration::from_millis(150);

    #[derive(Default)]
    struct MockTransport {
        calls: AtomicUsize,
        requests: Mutex<Vec<RenderRequest>>,
        slow_first: bool,
        reject: Option<ErrorCode>,
    }

    #[async_trait]
    impl RenderTransport for MockTransport {
        fn name(&self) -> &str {
            "mock"
        }

        async fn send(&self, request: RenderRequest) -> Result<RenderResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requests.lock().unwrap().push(request.clone());
            if self.slow_first && call == 1 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if let Some(code) = self.reject {
                return Ok(RenderResponse::error(code));
            }
            let contents = request
                .requests
                .iter()
                .map(|(id, contexts)| {
                    let n = contexts.len().max(1);
                    (id.clone(), vec![RenderedItem::content(format!("{id}@{call}")); n])
                })
                .collect();
            Ok(RenderResponse::Contents { contents })
        }
    }

    struct MockHost {
        anchor: NodeId,
        unaddressable: Option<&'static str>,
        applied: Mutex<Vec<(String, Vec<RenderedPlacement>)>>,
        fallbacks: Mutex<Vec<String>>,
    }

    impl MockHost {
        fn new() -> Self {
            let mut doc = Document::new();
            let anchor = doc.create_element("div", std::iter::empty::<(String, String)>());
            Self {
                anchor,
                unaddressable: None,
                applied: Mutex::default(),
                fallbacks: Mutex::default(),
            }
        }
    }

    impl BatchHost for MockHost {
        fn placements(&self, partial: &Partial) -> Result<Vec<Placement>> {
            if self.unaddressable == Some(partial.id()) {
                return Err(RefreshError::Document("invalid selector".to_owned()));
            }
            Ok(vec![Placement {
                partial_id: partial.id().to_owned(),
                anchor: Anchor::Element(self.anchor),
                context: None,
                instance_number: None,
            }])
        }

        fn dirty_settings(&self) -> BTreeMap<String, Value> {
            BTreeMap::from([("title".to_owned(), Value::from("Hello"))])
        }

        fn apply(&self, partial: &Arc<Partial>, rendered: &[RenderedPlacement]) -> Result<()> {
            self.applied
                .lock()
                .unwrap()
                .push((partial.id().to_owned(), rendered.to_vec()));
            Ok(())
        }

        fn fallback(&self, partial: &Partial, _error: &RefreshError) {
            self.fallbacks.lock().unwrap().push(partial.id().to_owned());
        }
    }

    struct Fixture {
        registry: Arc<PartialRegistry>,
        transport: Arc<MockTransport>,
        host: Arc<MockHost>,
        batcher: RenderBatcher,
    }

    fn fixture(transport: MockTransport) -> Fixture {
        fixture_with_host(transport, MockHost::new())
    }

    fn fixture_with_host(transport: MockTransport, host: MockHost) -> Fixture {
        let registry = Arc::new(PartialRegistry::new(Arc::new(KindTable::with_builtins())));
        let transport = Arc::new(transport);
        let host = Arc::new(host);
        let batcher = RenderBatcher::new(
            WINDOW,
            "token",
            Arc::clone(&transport) as Arc<dyn RenderTransport>,
            Arc::clone(&registry),
            Arc::clone(&host) as Arc<dyn BatchHost>,
        );
        Fixture {
            registry,
            transport,
            host,
            batcher,
        }
    }

    fn register(f: &Fixture, id: &str) -> Arc<Partial> {
        f.registry.register(id, PartialDescriptor::default()).unwrap()
    }

    fn content(outcome: &RefreshOutcome) -> String {
        outcome.as_ref().unwrap()[0].content.clone().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_in_one_window_share_one_round_trip() {
        let f = fixture(MockTransport::default());
        f.batcher.mark_ready();
        let handles: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| f.batcher.refresh(&register(&f, id)))
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 1);
        let requests = f.transport.requests.lock().unwrap();
        assert_eq!(requests[0].requests.len(), 3);
        assert_eq!(requests[0].auth_token, "token");
        assert_eq!(requests[0].dirty_settings["title"], "Hello");
        assert_eq!(f.batcher.state("a"), RefreshState::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_requests_share_the_pending_result() {
        let f = fixture(MockTransport::default());
        f.batcher.mark_ready();
        let a = register(&f, "a");
        let first = f.batcher.refresh(&a);
        let second = f.batcher.refresh(&a);
        assert_eq!(content(&first.await), "a@1");
        assert_eq!(content(&second.await), "a@1");
        assert_eq!(f.host.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_requests_keep_extending_the_window() {
        let f = fixture(MockTransport::default());
        f.batcher.mark_ready();
        let a = register(&f, "a");
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(f.batcher.refresh(&a));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 0);
        for h in handles {
            assert_eq!(content(&h.await), "a@1");
        }
        assert_eq!(f.batcher.round_trips(), 1);
        assert_eq!(f.host.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_round_trip_resolves_with_newer_data() {
        let f = fixture(MockTransport {
            slow_first: true,
            ..MockTransport::default()
        });
        f.batcher.mark_ready();
        let a = register(&f, "a");
        let first = f.batcher.refresh(&a);
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(f.batcher.state("a"), RefreshState::InFlight);

        let second = f.batcher.refresh(&a);
        assert_eq!(content(&first.await), "a@2");
        assert_eq!(content(&second.await), "a@2");
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.host.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_before_ready_fire_once_in_registration_order() {
        let f = fixture(MockTransport::default());
        let b = register(&f, "b");
        let a = register(&f, "a");
        let hb = f.batcher.refresh(&b);
        let ha = f.batcher.refresh(&a);
        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 0);

        f.batcher.mark_ready();
        f.batcher.mark_ready();
        ha.await.unwrap();
        hb.await.unwrap();
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 1);
        let order: Vec<_> = f
            .host
            .applied
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_partial_cancels_its_refresh() {
        let f = fixture(MockTransport::default());
        f.batcher.mark_ready();
        let a = register(&f, "a");
        let handle = f.batcher.refresh(&a);
        f.registry.remove("a");
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(f.host.fallbacks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_partial_mid_flight_cancels_without_applying() {
        let f = fixture(MockTransport {
            slow_first: true,
            ..MockTransport::default()
        });
        f.batcher.mark_ready();
        let a = register(&f, "a");
        let handle = f.batcher.refresh(&a);
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(f.batcher.state("a"), RefreshState::InFlight);

        f.registry.remove("a");
        assert!(handle.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 1);
        assert!(f.host.applied.lock().unwrap().is_empty());
        assert!(f.host.fallbacks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unaddressable_partial_fails_while_siblings_render() {
        let host = MockHost {
            unaddressable: Some("broken"),
            ..MockHost::new()
        };
        let f = fixture_with_host(MockTransport::default(), host);
        f.batcher.mark_ready();
        let broken = f.batcher.refresh(&register(&f, "broken"));
        let fine = f.batcher.refresh(&register(&f, "fine"));
        assert!(matches!(broken.await, Err(RefreshError::Document(_))));
        assert_eq!(content(&fine.await), "fine@1");
        assert_eq!(*f.host.fallbacks.lock().unwrap(), vec!["broken"]);
        assert_eq!(f.batcher.state("broken"), RefreshState::Failed);
        let requests = f.transport.requests.lock().unwrap();
        assert!(!requests[0].requests.contains_key("broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_rejection_fails_every_partial() {
        let f = fixture(MockTransport {
            reject: Some(ErrorCode::BadNonce),
            ..MockTransport::default()
        });
        f.batcher.mark_ready();
        let ha = f.batcher.refresh(&register(&f, "a"));
        let hb = f.batcher.refresh(&register(&f, "b"));
        assert!(matches!(ha.await, Err(RefreshError::Auth(ErrorCode::BadNonce))));
        assert!(matches!(hb.await, Err(RefreshError::Auth(ErrorCode::BadNonce))));
        assert_eq!(f.host.fallbacks.lock().unwrap().len(), 2);
        assert_eq!(f.batcher.state("b"), RefreshState::Failed);
    }

    #[test]
    fn pairing_checks_alignment() {
        let mut doc = Document::new();
        let el = doc.create_element("p", std::iter::empty::<(String, String)>());
        let placement = Placement {
            partial_id: "p".to_owned(),
            anchor: Anchor::Element(el),
            context: None,
            instance_number: None,
        };
        let two = vec![RenderedItem::content("x"), RenderedItem::content("y")];
        assert!(matches!(
            pair_items("p", vec![placement.clone()], Some(two)),
            Err(RefreshError::Validation(_))
        ));
        assert!(pair_items("p", Vec::new(), Some(vec![RenderedItem::content("x")]))
            .unwrap()
            .is_empty());
        assert!(matches!(
            pair_items("p", vec![placement.clone()], Some(vec![RenderedItem::error(ErrorCode::UnknownPartial)])),
            Err(RefreshError::UnknownPartial(_))
        ));
        let paired =
            pair_items("p", vec![placement], Some(vec![RenderedItem::error(ErrorCode::Unrecognized)]))
                .unwrap();
        assert_eq!(paired[0].error, Some(ErrorCode::Unrecognized));
    }
}
