use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{domain::ContactId, protocol::Contact};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{ClientError, ContactDirectory, Result};

/// Page size used when materializing a select-all across the whole query.
pub const FETCH_ALL_PAGE_SIZE: u32 = 500;
/// Delay before a keystroke-level search actually hits the directory.
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(400);
const DEFAULT_PAGE_SIZE: u32 = 10;

/// Derived state of the select-all indicator. Never stored; always
/// recomputed from the visible page and the selection set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectAllMode {
    None,
    Page,
    AllQuery,
}

/// The currently loaded slice of the contact directory.
#[derive(Debug, Clone)]
pub struct PageWindow {
    pub items: Vec<Contact>,
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub search: Option<String>,
}

impl PageWindow {
    fn empty(page_size: u32, search: Option<String>) -> Self {
        Self {
            items: Vec::new(),
            page: 1,
            page_size,
            total_items: 0,
            total_pages: 0,
            search,
        }
    }

    pub fn visible_ids(&self) -> impl Iterator<Item = &ContactId> {
        self.items.iter().map(|contact| &contact.id)
    }
}

#[derive(Debug, Clone)]
pub enum SelectionEvent {
    WindowUpdated { page: u32, total_items: u64 },
    SelectionChanged { selected: usize },
    FetchAllProgress { fetched: u64, total: u64 },
    Error(String),
}

struct SelectionState {
    window: PageWindow,
    selected: HashSet<ContactId>,
    /// Bumped by every window mutation; fetch responses carrying an older
    /// generation are stale and dropped instead of overwriting the window.
    generation: u64,
    fetch_all_in_flight: bool,
}

/// Reconciles a recipient selection against a remote, paginated, searchable
/// contact directory.
///
/// The selection survives paging and searching: ids chosen under one query
/// stay chosen when the window moves elsewhere. Only `select_all_matching`
/// replaces the set wholesale, and only after every page of the current
/// query has been walked successfully — a failed or cancelled walk leaves
/// the prior selection untouched.
pub struct RecipientSelection {
    directory: Arc<dyn ContactDirectory>,
    inner: Mutex<SelectionState>,
    cancel_fetch_all: AtomicBool,
    search_seq: AtomicU64,
    events: broadcast::Sender<SelectionEvent>,
}

/// Pure derivation of the select-all indicator from the visible window and
/// the selection set.
pub fn derive_select_all_mode(window: &PageWindow, selected: &HashSet<ContactId>) -> SelectAllMode {
    if window.items.is_empty() || !window.visible_ids().all(|id| selected.contains(id)) {
        return SelectAllMode::None;
    }
    if window.total_items > 0 && selected.len() as u64 >= window.total_items {
        SelectAllMode::AllQuery
    } else {
        SelectAllMode::Page
    }
}

impl RecipientSelection {
    pub fn new(directory: Arc<dyn ContactDirectory>) -> Arc<Self> {
        Self::with_page_size(directory, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(directory: Arc<dyn ContactDirectory>, page_size: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            directory,
            inner: Mutex::new(SelectionState {
                window: PageWindow::empty(page_size.max(1), None),
                selected: HashSet::new(),
                generation: 0,
                fetch_all_in_flight: false,
            }),
            cancel_fetch_all: AtomicBool::new(false),
            search_seq: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SelectionEvent> {
        self.events.subscribe()
    }

    // --- window ---

    /// Refetches the current page under the current query.
    pub async fn refresh(&self) -> Result<()> {
        let (page, search) = {
            let state = self.inner.lock().await;
            (state.window.page, state.window.search.clone())
        };
        self.fetch_window(page, search).await
    }

    /// Applies a new search query, jumping back to page 1. The selection
    /// set is never pruned: ids chosen under the previous query stay.
    pub async fn search(&self, query: impl Into<String>) -> Result<()> {
        let query = query.into();
        let search = match query.trim() {
            "" => None,
            trimmed => Some(trimmed.to_owned()),
        };
        self.fetch_window(1, search).await
    }

    /// Coalesces keystroke-level search input; only the latest pending
    /// query fires after [`SEARCH_DEBOUNCE`].
    pub fn debounced_search(self: &Arc<Self>, query: impl Into<String>) {
        let query = query.into();
        let seq = self.search_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SEARCH_DEBOUNCE).await;
            if this.search_seq.load(Ordering::SeqCst) != seq {
                return;
            }
            if let Err(err) = this.search(query).await {
                warn!("selection: debounced search failed: {err}");
            }
        });
    }

    pub async fn change_page(&self, page: u32) -> Result<()> {
        let search = {
            let state = self.inner.lock().await;
            state.window.search.clone()
        };
        self.fetch_window(page.max(1), search).await
    }

    async fn fetch_window(&self, page: u32, search: Option<String>) -> Result<()> {
        let (generation, page_size) = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            (state.generation, state.window.page_size)
        };

        match self.directory.list(page, page_size, search.as_deref()).await {
            Ok(fetched) => {
                let mut state = self.inner.lock().await;
                if state.generation != generation {
                    info!(page, "selection: dropping stale page response");
                    return Ok(());
                }
                state.window = PageWindow {
                    items: fetched.items,
                    page: fetched.pagination.page,
                    page_size,
                    total_items: fetched.pagination.total_items,
                    total_pages: fetched.pagination.total_pages,
                    search,
                };
                let _ = self.events.send(SelectionEvent::WindowUpdated {
                    page: state.window.page,
                    total_items: state.window.total_items,
                });
                Ok(())
            }
            Err(err) => {
                // Fetch failures degrade the window to empty; the selection
                // set is left alone.
                let mut state = self.inner.lock().await;
                if state.generation == generation {
                    state.window = PageWindow::empty(page_size, search);
                    let _ = self.events.send(SelectionEvent::WindowUpdated {
                        page: 1,
                        total_items: 0,
                    });
                }
                let _ = self.events.send(SelectionEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    // --- selection ---

    /// Adds or removes a single id. Idempotent set membership.
    pub async fn toggle(&self, id: ContactId, on: bool) {
        if id.0.is_empty() {
            return;
        }
        let mut state = self.inner.lock().await;
        let changed = if on {
            state.selected.insert(id)
        } else {
            state.selected.remove(&id)
        };
        if changed {
            let _ = self.events.send(SelectionEvent::SelectionChanged {
                selected: state.selected.len(),
            });
        }
    }

    /// Unions or removes exactly the ids visible in the current window.
    /// Ids selected from other pages or queries are untouched.
    pub async fn select_page(&self, on: bool) {
        let mut state = self.inner.lock().await;
        let visible: Vec<ContactId> = state.window.visible_ids().cloned().collect();
        for id in visible {
            if on {
                state.selected.insert(id);
            } else {
                state.selected.remove(&id);
            }
        }
        let _ = self.events.send(SelectionEvent::SelectionChanged {
            selected: state.selected.len(),
        });
    }

    /// `on = true`: walks every page of the current query and replaces the
    /// selection with the full id set. `on = false`: clears the selection.
    ///
    /// Returns `Ok(true)` when applied, `Ok(false)` when cancelled or a
    /// walk is already in flight. On error the prior selection is
    /// preserved.
    pub async fn select_all_matching(&self, on: bool) -> Result<bool> {
        if !on {
            let mut state = self.inner.lock().await;
            state.selected.clear();
            let _ = self
                .events
                .send(SelectionEvent::SelectionChanged { selected: 0 });
            return Ok(true);
        }

        let search = {
            let mut state = self.inner.lock().await;
            if state.fetch_all_in_flight {
                info!("selection: select-all already in flight, skipping duplicate trigger");
                return Ok(false);
            }
            state.fetch_all_in_flight = true;
            state.window.search.clone()
        };
        self.cancel_fetch_all.store(false, Ordering::SeqCst);

        let walked = self.fetch_all_matching(search).await;
        self.inner.lock().await.fetch_all_in_flight = false;

        match walked {
            Ok(Some(ids)) => {
                let mut state = self.inner.lock().await;
                state.selected = ids;
                let _ = self.events.send(SelectionEvent::SelectionChanged {
                    selected: state.selected.len(),
                });
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                let _ = self.events.send(SelectionEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn fetch_all_matching(
        &self,
        search: Option<String>,
    ) -> std::result::Result<Option<HashSet<ContactId>>, ClientError> {
        let mut ids: HashSet<ContactId> = HashSet::new();
        let mut page = 1u32;

        loop {
            if self.cancel_fetch_all.load(Ordering::SeqCst) {
                info!(fetched = ids.len(), "selection: select-all cancelled");
                return Ok(None);
            }

            let fetched = self
                .directory
                .list(page, FETCH_ALL_PAGE_SIZE, search.as_deref())
                .await?;
            let total = fetched.pagination.total_items;
            let served = fetched.items.len();
            for contact in fetched.items {
                ids.insert(contact.id);
            }
            let _ = self.events.send(SelectionEvent::FetchAllProgress {
                fetched: ids.len() as u64,
                total,
            });

            // Hard stops so a lying pagination block cannot wedge the loop.
            if ids.len() as u64 >= total || served == 0 || page >= fetched.pagination.total_pages {
                info!(selected = ids.len(), total, "selection: select-all materialized");
                return Ok(Some(ids));
            }
            page += 1;
        }
    }

    pub fn cancel_select_all(&self) {
        self.cancel_fetch_all.store(true, Ordering::SeqCst);
    }

    // --- accessors ---

    pub async fn select_all_mode(&self) -> SelectAllMode {
        let state = self.inner.lock().await;
        derive_select_all_mode(&state.window, &state.selected)
    }

    pub async fn window(&self) -> PageWindow {
        self.inner.lock().await.window.clone()
    }

    pub async fn selected_ids(&self) -> Vec<ContactId> {
        self.inner.lock().await.selected.iter().cloned().collect()
    }

    pub async fn selected_count(&self) -> usize {
        self.inner.lock().await.selected.len()
    }

    pub async fn is_selected(&self, id: &ContactId) -> bool {
        self.inner.lock().await.selected.contains(id)
    }

    // --- submission ---

    /// Materializes the final recipient list: resolves the selection
    /// against the directory, drops unsubscribed contacts and duplicates
    /// by email. Ids the directory no longer knows simply do not come back.
    pub async fn recipients(&self) -> Result<Vec<Contact>> {
        let ids = self.selected_ids().await;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let contacts = self.directory.list_by_ids(&ids).await?;
        let mut seen = HashSet::new();
        let mut recipients = Vec::with_capacity(contacts.len());
        let mut unsubscribed = 0usize;
        for contact in contacts {
            if contact.unsubscribed {
                unsubscribed += 1;
                continue;
            }
            if seen.insert(contact.email.to_ascii_lowercase()) {
                recipients.push(contact);
            }
        }
        if unsubscribed > 0 {
            info!(
                dropped = unsubscribed,
                "selection: dropped unsubscribed recipients at submit"
            );
        }
        Ok(recipients)
    }
}

#[cfg(test)]
#[path = "tests/selection_tests.rs"]
mod tests;
