//! Feed controller: the state machine owning one viewer session's `ViewState`.
//!
//! Compositions, overlay openings and hook calls run as futures multiplexed on the
//! controller's own task; overlay pushes arrive through a channel tagged with the
//! generation of the subscription that produced them. Results that lost a race
//! (superseded compositions, stale overlay generations) are dropped when they are
//! applied, never when they are fetched.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::actions::{PostActions, VoteOutcome};
use crate::composer::{Feed, FeedComposer};
use crate::error::{FeedError, StoreError};
use crate::membership::{Identity, PersonalizationContext};
use crate::model::{item_ids, ContentItem, VoteMap};
use crate::overlay::{SubscriptionHandle, VoteOverlaySubscriber};

/// Externally observable session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewState {
    pub feed: Feed,
    /// Viewer's votes, only ever for items in `feed`
    pub votes: VoteMap,
    pub loading: bool,
    /// Last failure, kept until the next successful composition
    pub error: Option<String>,
    pub selected: Option<ContentItem>,
}

impl ViewState {
    /// Viewer's vote value on an item, if any.
    pub fn vote_for(&self, item_id: &str) -> Option<i32> {
        self.votes.get(item_id).map(|record| record.vote_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Idle,
    Composing,
    Ready,
    Failed,
}

/// What started a composition. Each cause has at most one live composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositionCause {
    /// Membership data became ready
    Membership,
    /// Identity resolved with no viewer
    Anonymous,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    MembershipChanged(PersonalizationContext),
    IdentityChanged(Identity),
    /// Re-run the last composition
    Retry,
    Vote { item_id: String, delta: i32 },
    DeletePost { item_id: String },
    SelectPost { item_id: String },
}

enum Completion {
    Composed {
        cause: CompositionCause,
        seq: u64,
        viewer_id: Option<String>,
        result: Result<Feed, FeedError>,
    },
    OverlayOpened {
        generation: u64,
        result: Result<SubscriptionHandle, FeedError>,
    },
    Voted {
        viewer_id: String,
        item_id: String,
        result: Result<VoteOutcome, StoreError>,
    },
    Deleted {
        item_id: String,
        result: Result<(), StoreError>,
    },
    Selected {
        item: ContentItem,
        result: Result<(), StoreError>,
    },
}

struct OverlayUpdate {
    generation: u64,
    votes: VoteMap,
}

pub struct FeedController {
    composer: FeedComposer,
    overlay: VoteOverlaySubscriber,
    actions: Arc<dyn PostActions>,

    state: ViewState,
    view: watch::Sender<ViewState>,
    phase: FeedPhase,
    feed_installed: bool,
    composition_failed: bool,

    context: PersonalizationContext,
    identity: Identity,

    next_seq: u64,
    latest: HashMap<CompositionCause, u64>,
    pending: HashSet<CompositionCause>,
    last_cause: Option<CompositionCause>,

    subscription: Option<SubscriptionHandle>,
    overlay_generation: u64,
    overlay_tx: mpsc::UnboundedSender<OverlayUpdate>,
    overlay_rx: mpsc::UnboundedReceiver<OverlayUpdate>,

    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl FeedController {
    pub fn new(
        composer: FeedComposer,
        overlay: VoteOverlaySubscriber,
        actions: Arc<dyn PostActions>,
    ) -> Self {
        let (view, _) = watch::channel(ViewState::default());
        let (overlay_tx, overlay_rx) = mpsc::unbounded_channel();
        Self {
            composer,
            overlay,
            actions,
            state: ViewState::default(),
            view,
            phase: FeedPhase::Idle,
            feed_installed: false,
            composition_failed: false,
            context: PersonalizationContext::default(),
            identity: Identity::resolving(),
            next_seq: 0,
            latest: HashMap::new(),
            pending: HashSet::new(),
            last_cause: None,
            subscription: None,
            overlay_generation: 0,
            overlay_tx,
            overlay_rx,
            inflight: FuturesUnordered::new(),
        }
    }

    /// Read-only projection for the presentation layer.
    pub fn subscribe_view(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    pub fn view(&self) -> &ViewState {
        &self.state
    }

    pub fn phase(&self) -> FeedPhase {
        self.phase
    }

    pub fn overlay_active(&self) -> bool {
        self.subscription.is_some()
    }

    /// React to one upstream event. Any I/O it triggers is queued, not awaited.
    pub fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::MembershipChanged(context) => {
                let became_ready = context.ready && !self.context.ready;
                self.context = context;
                if became_ready {
                    self.start_composition(CompositionCause::Membership);
                }
            }
            ControllerEvent::IdentityChanged(identity) => self.apply_identity(identity),
            ControllerEvent::Retry => match self.last_cause {
                Some(cause) => self.start_composition(cause),
                None => debug!("retry requested before any composition"),
            },
            ControllerEvent::Vote { item_id, delta } => self.forward_vote(item_id, delta),
            ControllerEvent::DeletePost { item_id } => self.forward_delete(item_id),
            ControllerEvent::SelectPost { item_id } => self.forward_select(item_id),
        }
    }

    /// Wait for the next completion or overlay delivery and apply it.
    /// Returns `false` when nothing is in flight, no overlay is open and no
    /// delivery is queued.
    pub async fn step(&mut self) -> bool {
        if self.inflight.is_empty() && self.subscription.is_none() {
            return match self.overlay_rx.try_recv() {
                Ok(update) => {
                    self.apply_overlay_update(update);
                    true
                }
                Err(_) => false,
            };
        }

        tokio::select! {
            Some(completion) = self.inflight.next(), if !self.inflight.is_empty() => {
                self.apply(completion);
                true
            }
            Some(update) = self.overlay_rx.recv() => {
                self.apply_overlay_update(update);
                true
            }
            else => false,
        }
    }

    /// Drive queued work to completion, then apply overlay deliveries already queued.
    pub async fn settle(&mut self) {
        while let Some(completion) = self.inflight.next().await {
            self.apply(completion);
        }
        while let Ok(update) = self.overlay_rx.try_recv() {
            self.apply_overlay_update(update);
        }
    }

    /// Event loop for a session; returns when the event sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<ControllerEvent>) {
        info!("feed controller started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                Some(completion) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.apply(completion);
                }
                Some(update) = self.overlay_rx.recv() => self.apply_overlay_update(update),
            }
        }
        self.teardown_overlay();
        self.publish();
        info!("feed controller stopped");
    }

    fn publish(&self) {
        self.view.send_replace(self.state.clone());
    }

    fn settle_phase(&mut self) {
        self.phase = if self.state.loading {
            FeedPhase::Composing
        } else if self.composition_failed {
            FeedPhase::Failed
        } else if self.feed_installed {
            FeedPhase::Ready
        } else {
            FeedPhase::Idle
        };
    }

    fn apply_identity(&mut self, identity: Identity) {
        if identity == self.identity {
            return;
        }
        let previous = std::mem::replace(&mut self.identity, identity);

        if previous.viewer_id != self.identity.viewer_id {
            match (&previous.viewer_id, &self.identity.viewer_id) {
                (Some(old), None) => info!(viewer = %old, "viewer signed out"),
                (_, Some(new)) => info!(viewer = %new, "viewer signed in"),
                (None, None) => {}
            }
            self.rescope_overlay();
            self.publish();

            // A membership composition started for the previous viewer would be dropped on arrival.
            if self.identity.viewer_id.is_some() && self.context.ready {
                self.start_composition(CompositionCause::Membership);
            }
        }

        if self.identity.resolved && self.identity.viewer_id.is_none() {
            self.start_composition(CompositionCause::Anonymous);
        }
    }

    fn start_composition(&mut self, cause: CompositionCause) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if self.latest.insert(cause, seq).is_some() && self.pending.contains(&cause) {
            debug!(?cause, seq, "superseding in-flight composition");
        }
        self.pending.insert(cause);
        self.last_cause = Some(cause);

        let (context, viewer_id) = match cause {
            CompositionCause::Membership => (self.context.clone(), self.identity.viewer_id.clone()),
            CompositionCause::Anonymous => (PersonalizationContext::default(), None),
        };

        let composer = self.composer.clone();
        self.inflight.push(
            async move {
                let result = composer.compose(&context, viewer_id.is_some()).await;
                Completion::Composed { cause, seq, viewer_id, result }
            }
            .boxed(),
        );

        self.state.loading = true;
        self.phase = FeedPhase::Composing;
        self.publish();
    }

    fn apply(&mut self, completion: Completion) {
        match completion {
            Completion::Composed { cause, seq, viewer_id, result } => {
                self.apply_composition(cause, seq, viewer_id, result)
            }
            Completion::OverlayOpened { generation, result } => self.apply_overlay_opened(generation, result),
            Completion::Voted { viewer_id, item_id, result } => self.apply_vote(viewer_id, item_id, result),
            Completion::Deleted { item_id, result } => self.apply_delete(item_id, result),
            Completion::Selected { item, result } => match result {
                Ok(()) => {
                    self.state.selected = Some(item);
                    self.publish();
                }
                Err(e) => self.report(FeedError::Mutation(e)),
            },
        }
    }

    fn apply_composition(
        &mut self,
        cause: CompositionCause,
        seq: u64,
        viewer_id: Option<String>,
        result: Result<Feed, FeedError>,
    ) {
        if self.latest.get(&cause) != Some(&seq) {
            debug!(?cause, seq, "discarding superseded composition");
            return;
        }
        self.pending.remove(&cause);
        self.state.loading = !self.pending.is_empty();

        if viewer_id != self.identity.viewer_id {
            debug!(?cause, "discarding feed composed for a different viewer");
        } else {
            match result {
                Ok(feed) => {
                    info!(?cause, items = feed.len(), "feed installed");
                    self.install_feed(feed);
                    self.feed_installed = true;
                    self.composition_failed = false;
                    self.state.error = None;
                }
                Err(e) => {
                    warn!(?cause, error = %e, "feed composition failed; keeping previous feed");
                    self.composition_failed = true;
                    self.state.error = Some(e.to_string());
                }
            }
        }

        self.settle_phase();
        self.publish();
    }

    /// Replace the feed; a changed id set re-scopes the overlay.
    fn install_feed(&mut self, feed: Feed) {
        let scope_changed = item_ids(&self.state.feed) != item_ids(&feed);
        self.state.feed = feed;
        if let Some(selected) = &self.state.selected {
            if !self.state.feed.iter().any(|item| item.id == selected.id) {
                self.state.selected = None;
            }
        }
        if scope_changed {
            self.rescope_overlay();
        }
    }

    /// Cancel the current overlay and clear votes; open a new one when a viewer is
    /// present and the feed is non-empty.
    fn rescope_overlay(&mut self) {
        self.teardown_overlay();

        let Some(viewer_id) = self.identity.viewer_id.clone() else {
            return;
        };
        let ids = item_ids(&self.state.feed);
        if ids.is_empty() {
            return;
        }

        let generation = self.overlay_generation;
        let tx = self.overlay_tx.clone();
        let overlay = self.overlay.clone();
        debug!(generation, items = ids.len(), "opening vote overlay");
        self.inflight.push(
            async move {
                let result = overlay
                    .subscribe(&viewer_id, &ids, move |votes| {
                        // The receiver lives as long as the controller.
                        let _ = tx.send(OverlayUpdate { generation, votes });
                    })
                    .await;
                Completion::OverlayOpened { generation, result }
            }
            .boxed(),
        );
    }

    fn teardown_overlay(&mut self) {
        if let Some(mut handle) = self.subscription.take() {
            handle.cancel();
            debug!(generation = self.overlay_generation, "vote overlay cancelled");
        }
        // Invalidates queued deliveries and openings still in flight.
        self.overlay_generation += 1;
        self.state.votes.clear();
    }

    fn apply_overlay_opened(&mut self, generation: u64, result: Result<SubscriptionHandle, FeedError>) {
        match result {
            Ok(handle) if generation == self.overlay_generation => {
                self.subscription = Some(handle);
            }
            Ok(mut handle) => {
                handle.cancel();
                debug!(generation, "cancelled overlay that was superseded while opening");
            }
            Err(FeedError::InvalidSubscriptionRequest(reason)) => {
                error!(reason, "controller issued an invalid overlay subscription");
            }
            Err(e) => warn!(error = %e, "vote overlay could not be opened"),
        }
    }

    fn apply_overlay_update(&mut self, update: OverlayUpdate) {
        if update.generation != self.overlay_generation {
            debug!(generation = update.generation, "dropping stale overlay delivery");
            return;
        }
        let feed = &self.state.feed;
        self.state.votes = update
            .votes
            .into_iter()
            .filter(|(item_id, _)| feed.iter().any(|item| &item.id == item_id))
            .collect();
        self.publish();
    }

    fn find_item(&self, item_id: &str) -> Option<ContentItem> {
        self.state.feed.iter().find(|item| item.id == item_id).cloned()
    }

    fn report(&mut self, e: FeedError) {
        warn!(error = %e, "post action failed");
        self.state.error = Some(e.to_string());
        self.publish();
    }

    fn forward_vote(&mut self, item_id: String, delta: i32) {
        let Some(viewer_id) = self.identity.viewer_id.clone() else {
            return self.report(FeedError::SignInRequired("vote"));
        };
        let Some(item) = self.find_item(&item_id) else {
            return self.report(FeedError::UnknownItem(item_id));
        };

        let actions = self.actions.clone();
        self.inflight.push(
            async move {
                let result = actions.vote(&viewer_id, &item, delta).await;
                Completion::Voted { viewer_id, item_id, result }
            }
            .boxed(),
        );
    }

    fn apply_vote(&mut self, viewer_id: String, item_id: String, result: Result<VoteOutcome, StoreError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.report(FeedError::Mutation(e)),
        };

        let Some(item) = self.state.feed.iter_mut().find(|item| item.id == item_id) else {
            debug!(item = %item_id, "voted item left the feed before the vote landed");
            return;
        };
        item.vote_status += outcome.vote_status_delta;
        if let Some(selected) = self.state.selected.as_mut().filter(|s| s.id == item_id) {
            selected.vote_status += outcome.vote_status_delta;
        }

        // The live overlay confirms the record later; reflect it now for the same viewer.
        if self.identity.viewer_id.as_deref() == Some(viewer_id.as_str()) {
            match outcome.record {
                Some(record) => {
                    self.state.votes.insert(item_id, record);
                }
                None => {
                    self.state.votes.remove(&item_id);
                }
            }
        }
        self.publish();
    }

    fn forward_delete(&mut self, item_id: String) {
        let Some(item) = self.find_item(&item_id) else {
            return self.report(FeedError::UnknownItem(item_id));
        };
        let actions = self.actions.clone();
        self.inflight.push(
            async move {
                let result = actions.delete_post(&item).await;
                Completion::Deleted { item_id, result }
            }
            .boxed(),
        );
    }

    fn apply_delete(&mut self, item_id: String, result: Result<(), StoreError>) {
        if let Err(e) = result {
            return self.report(FeedError::Mutation(e));
        }
        let feed: Feed = self
            .state
            .feed
            .iter()
            .filter(|item| item.id != item_id)
            .cloned()
            .collect();
        self.install_feed(feed);
        self.publish();
    }

    fn forward_select(&mut self, item_id: String) {
        let Some(item) = self.find_item(&item_id) else {
            return self.report(FeedError::UnknownItem(item_id));
        };
        let actions = self.actions.clone();
        self.inflight.push(
            async move {
                let result = actions.select_post(&item).await;
                Completion::Selected { item, result }
            }
            .boxed(),
        );
    }
}
