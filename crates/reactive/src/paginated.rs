//! Paginated query composer.
//!
//! A paginated subscription is built out of ordinary page subscriptions. Each
//! page is a plain query whose arguments are the caller's arguments plus a
//! `paginationOpts` object, so the subscription manager dedups and caches
//! pages like any other query. The composer tracks which pages belong to which
//! paginated token, concatenates their results, and turns page-level
//! transitions into paginated-token transitions.
//!
//! Pages reporting a `splitCursor` are split in two once the server asks for
//! it (or once they hold more than twice the requested items). Both halves are
//! subscribed first; the original page is only swapped out and released when
//! both halves have results, so the visible list never flickers.

use crate::manager::SubscriptionManager;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::rc::Rc;
use tidal_core::{
    normalize_args, Error, FunctionError, FunctionPath, LookupError, PaginatedQueryToken,
    PaginationOptions, QueryToken,
};
use tracing::{debug, error};

const PAGINATION_OPTS: &str = "paginationOpts";

/// Where a paginated list stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PaginationStatus {
    /// All loaded pages are ready and more items exist.
    CanLoadMore,
    /// A later page is still loading.
    LoadingMore,
    /// The last page reached the end of the list.
    Exhausted,
}

/// Aggregated view of all loaded pages.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult {
    pub results: Vec<Value>,
    pub status: PaginationStatus,
    pub is_done: bool,
    pub continue_cursor: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
enum PageStatus {
    SplitRecommended,
    SplitRequired,
}

/// Value produced by one page query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResult {
    page: Vec<Value>,
    is_done: bool,
    continue_cursor: String,
    #[serde(default)]
    split_cursor: Option<String>,
    #[serde(default)]
    page_status: Option<PageStatus>,
}

impl PageResult {
    #[inline]
    fn is_split_required(&self) -> bool {
        self.page_status == Some(PageStatus::SplitRequired)
    }
}

type PageKey = u32;

#[derive(Clone, Debug)]
struct PageBounds {
    cursor: Option<String>,
    end_cursor: Option<String>,
    num_items: u32,
}

#[derive(Clone, Debug)]
struct PageSlot {
    token: QueryToken,
    bounds: PageBounds,
}

#[derive(Clone, Copy, Debug)]
struct OngoingSplit {
    page: PageKey,
    left: PageKey,
    right: PageKey,
}

/// Externally visible state of one paginated query, for change detection.
type Snapshot = Result<Option<PaginatedResult>, FunctionError>;

struct PaginatedQuery {
    path: FunctionPath,
    args: Map<String, Value>,
    options: PaginationOptions,
    subscribers: usize,
    /// Visible pages, in list order
    pages: Vec<PageKey>,
    /// Every subscribed page, visible or half of an ongoing split
    slots: HashMap<PageKey, PageSlot>,
    splits: Vec<OngoingSplit>,
    next_key: PageKey,
    last: Snapshot,
}

impl PaginatedQuery {
    fn new(path: FunctionPath, args: Map<String, Value>, options: PaginationOptions) -> Self {
        Self {
            path,
            args,
            options,
            subscribers: 1,
            pages: Vec::new(),
            slots: HashMap::new(),
            splits: Vec::new(),
            next_key: 0,
            last: Ok(None),
        }
    }

    fn add_slot(&mut self, slot: PageSlot) -> PageKey {
        let key = self.next_key;
        self.next_key += 1;
        self.slots.insert(key, slot);
        key
    }

    fn visible_tokens(&self) -> Vec<QueryToken> {
        self.pages
            .iter()
            .filter_map(|key| self.slots.get(key))
            .map(|slot| slot.token.clone())
            .collect()
    }

    fn is_splitting(&self, key: PageKey) -> bool {
        self.splits.iter().any(|split| split.page == key)
    }
}

#[derive(Default)]
struct ComposerState {
    queries: HashMap<PaginatedQueryToken, PaginatedQuery>,
    /// Page token -> paginated tokens that subscribed it
    owners: HashMap<QueryToken, Vec<PaginatedQueryToken>>,
}

impl ComposerState {
    fn own(&mut self, page: QueryToken, owner: PaginatedQueryToken) {
        self.owners.entry(page).or_default().push(owner);
    }

    fn disown(&mut self, page: &QueryToken, owner: &PaginatedQueryToken) {
        if let Some(owners) = self.owners.get_mut(page) {
            if let Some(pos) = owners.iter().position(|t| t == owner) {
                owners.swap_remove(pos);
            }
            if owners.is_empty() {
                self.owners.remove(page);
            }
        }
    }
}

/// Composes page subscriptions into paginated subscriptions.
#[derive(Clone)]
pub struct PaginatedQueryComposer {
    manager: Rc<dyn SubscriptionManager>,
    state: Rc<RefCell<ComposerState>>,
}

impl PaginatedQueryComposer {
    /// Creates a composer subscribing pages through `manager`.
    pub fn new(manager: Rc<dyn SubscriptionManager>) -> Self {
        Self {
            manager,
            state: Rc::new(RefCell::new(ComposerState::default())),
        }
    }

    /// Adds interest in a paginated query and returns its token.
    ///
    /// The first subscription for a token subscribes its first page; later
    /// ones only bump the refcount.
    pub fn subscribe(
        &self,
        path: &FunctionPath,
        args: Value,
        options: PaginationOptions,
    ) -> tidal_core::Result<PaginatedQueryToken> {
        let args = normalize_args(args)?;
        let token = PaginatedQueryToken::from_parts(path, args.clone(), &options)?;

        if let Some(query) = self.state.borrow_mut().queries.get_mut(&token) {
            query.subscribers += 1;
            return Ok(token);
        }

        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let first = PageBounds {
            cursor: None,
            end_cursor: None,
            num_items: options.initial_num_items(),
        };
        let slot = self.subscribe_page(path, &args, &options, first)?;
        debug!(token = %token, page = %slot.token, "Subscribed first page");

        let mut query = PaginatedQuery::new(path.clone(), args, options);
        let page_token = slot.token.clone();
        let key = query.add_slot(slot);
        query.pages.push(key);

        let mut state = self.state.borrow_mut();
        state.own(page_token, token.clone());
        state.queries.insert(token.clone(), query);
        Ok(token)
    }

    /// Drops one unit of interest. At zero every page, including the halves
    /// of ongoing splits, is released.
    pub fn unsubscribe(&self, token: &PaginatedQueryToken) {
        let released = {
            let mut state = self.state.borrow_mut();
            let Some(query) = state.queries.get_mut(token) else {
                return;
            };
            query.subscribers = query.subscribers.saturating_sub(1);
            if query.subscribers > 0 {
                return;
            }
            let Some(query) = state.queries.remove(token) else {
                return;
            };
            let pages: Vec<QueryToken> = query.slots.into_values().map(|slot| slot.token).collect();
            for page in &pages {
                state.disown(page, token);
            }
            pages
        };

        debug!(token = %token, pages = released.len(), "Tearing down paginated query");
        for page in &released {
            self.manager.unsubscribe(page);
        }
    }

    /// Returns true while at least one subscription holds `token`.
    pub fn is_subscribed(&self, token: &PaginatedQueryToken) -> bool {
        self.state.borrow().queries.contains_key(token)
    }

    /// Returns the number of subscriptions holding `token`.
    pub fn subscriber_count(&self, token: &PaginatedQueryToken) -> usize {
        self.state
            .borrow()
            .queries
            .get(token)
            .map_or(0, |query| query.subscribers)
    }

    /// Returns the tokens of the visible pages, in list order.
    pub fn page_tokens(&self, token: &PaginatedQueryToken) -> Vec<QueryToken> {
        self.state
            .borrow()
            .queries
            .get(token)
            .map(PaginatedQuery::visible_tokens)
            .unwrap_or_default()
    }

    /// Returns the number of active paginated queries.
    pub fn len(&self) -> usize {
        self.state.borrow().queries.len()
    }

    /// Returns true if no paginated query is active.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().queries.is_empty()
    }

    /// Returns true once the first page has a result or an error.
    pub fn has_local_query_result(&self, token: &PaginatedQueryToken) -> bool {
        matches!(
            self.local_query_result(token),
            Ok(Some(_)) | Err(LookupError::Function(_))
        )
    }

    /// Concatenates the loaded pages of `token`.
    ///
    /// Returns `Ok(None)` until the first page has loaded. Loading stops at the
    /// first page without a usable result; everything after it is hidden and
    /// the status becomes `LoadingMore`.
    pub fn local_query_result(
        &self,
        token: &PaginatedQueryToken,
    ) -> Result<Option<PaginatedResult>, LookupError> {
        let pages = match self.state.borrow().queries.get(token) {
            Some(query) => query.visible_tokens(),
            None => return Ok(None),
        };

        let mut results = Vec::new();
        let mut last: Option<PageResult> = None;
        let mut loading = false;
        for page_token in &pages {
            match self.read_page(page_token)? {
                Some(mut page) if !page.is_split_required() => {
                    results.append(&mut page.page);
                    last = Some(page);
                }
                _ => {
                    loading = true;
                    break;
                }
            }
        }

        let Some(last) = last else {
            return Ok(None);
        };
        let (status, is_done) = if loading {
            (PaginationStatus::LoadingMore, false)
        } else if last.is_done {
            (PaginationStatus::Exhausted, true)
        } else {
            (PaginationStatus::CanLoadMore, false)
        };

        Ok(Some(PaginatedResult {
            results,
            status,
            is_done,
            continue_cursor: Some(last.continue_cursor),
        }))
    }

    /// Appends a page of `num_items` after the last page.
    ///
    /// Only succeeds when the last page is loaded and not done, so calling this
    /// twice before the new page arrives extends the list once. Returns false
    /// when nothing was appended (pending page, exhausted, torn down).
    pub fn load_more(
        &self,
        token: &PaginatedQueryToken,
        num_items: u32,
    ) -> tidal_core::Result<bool> {
        if num_items == 0 {
            return Err(Error::invalid_pagination_options(
                "numItems must be a positive integer",
            ));
        }

        let (path, args, options, last_key, last_token) = {
            let state = self.state.borrow();
            let Some(query) = state.queries.get(token) else {
                return Ok(false);
            };
            let Some(&last_key) = query.pages.last() else {
                return Ok(false);
            };
            let Some(slot) = query.slots.get(&last_key) else {
                return Ok(false);
            };
            (
                query.path.clone(),
                query.args.clone(),
                query.options,
                last_key,
                slot.token.clone(),
            )
        };

        let cursor = match self.read_page(&last_token) {
            Ok(Some(page)) if !page.is_done && !page.is_split_required() => page.continue_cursor,
            Ok(_) => return Ok(false),
            Err(e) => {
                debug!(token = %token, error = %e, "Last page has no usable result");
                return Ok(false);
            }
        };

        let bounds = PageBounds {
            cursor: Some(cursor),
            end_cursor: None,
            num_items,
        };
        let slot = self.subscribe_page(&path, &args, &options, bounds)?;
        let page_token = slot.token.clone();

        let appended = {
            let mut state = self.state.borrow_mut();
            let appended = match state.queries.get_mut(token) {
                Some(query) if query.pages.last() == Some(&last_key) => {
                    let key = query.add_slot(slot);
                    query.pages.push(key);
                    true
                }
                _ => false,
            };
            if appended {
                state.own(page_token.clone(), token.clone());
            }
            appended
        };

        if appended {
            debug!(token = %token, page = %page_token, num_items, "Loading more");
        } else {
            self.manager.unsubscribe(&page_token);
        }
        Ok(appended)
    }

    /// Recomputes the aggregate of `token`.
    ///
    /// Returns true if it differs from the last one observed.
    pub fn refresh(&self, token: &PaginatedQueryToken) -> Result<bool, LookupError> {
        let current: Snapshot = match self.local_query_result(token) {
            Ok(result) => Ok(result),
            Err(LookupError::Function(e)) => Err(e),
            Err(corrupt) => return Err(corrupt),
        };

        let mut state = self.state.borrow_mut();
        let Some(query) = state.queries.get_mut(token) else {
            return Ok(false);
        };
        if query.last == current {
            return Ok(false);
        }
        query.last = current;
        Ok(true)
    }

    /// Maps changed page tokens to the paginated tokens whose aggregate
    /// changed, advancing page splits along the way.
    pub fn process_transition(
        &self,
        changed: &[QueryToken],
    ) -> Result<Vec<PaginatedQueryToken>, LookupError> {
        let affected: Vec<PaginatedQueryToken> = {
            let state = self.state.borrow();
            let mut affected: Vec<PaginatedQueryToken> = Vec::new();
            for page in changed {
                for owner in state.owners.get(page).into_iter().flatten() {
                    if !affected.contains(owner) {
                        affected.push(owner.clone());
                    }
                }
            }
            affected
        };

        let mut updated = Vec::new();
        for token in affected {
            self.complete_splits(&token);
            self.start_splits(&token)?;
            if self.refresh(&token)? {
                updated.push(token);
            }
        }
        Ok(updated)
    }

    fn subscribe_page(
        &self,
        path: &FunctionPath,
        args: &Map<String, Value>,
        options: &PaginationOptions,
        bounds: PageBounds,
    ) -> tidal_core::Result<PageSlot> {
        let token = self
            .manager
            .subscribe(path, &page_args(args, options, &bounds))?;
        Ok(PageSlot { token, bounds })
    }

    fn read_page(&self, token: &QueryToken) -> Result<Option<PageResult>, LookupError> {
        let Some(value) = self.manager.local_query_result(token)? else {
            return Ok(None);
        };
        PageResult::deserialize(&value)
            .map(Some)
            .map_err(|e| {
                LookupError::Corrupt(format!("malformed page result for {}: {}", token, e))
            })
    }

    /// Swaps in split halves that both have results.
    fn complete_splits(&self, token: &PaginatedQueryToken) {
        let splits: Vec<(OngoingSplit, QueryToken, QueryToken)> = {
            let state = self.state.borrow();
            let Some(query) = state.queries.get(token) else {
                return;
            };
            query
                .splits
                .iter()
                .filter_map(|split| {
                    let left = query.slots.get(&split.left)?;
                    let right = query.slots.get(&split.right)?;
                    Some((*split, left.token.clone(), right.token.clone()))
                })
                .collect()
        };

        for (split, left, right) in splits {
            if !self.manager.has_local_query_result(&left)
                || !self.manager.has_local_query_result(&right)
            {
                continue;
            }

            let released = {
                let mut state = self.state.borrow_mut();
                let Some(query) = state.queries.get_mut(token) else {
                    return;
                };
                query.splits.retain(|s| s.page != split.page);
                if let Some(pos) = query.pages.iter().position(|&key| key == split.page) {
                    query.pages[pos] = split.left;
                    query.pages.insert(pos + 1, split.right);
                }
                let old = query.slots.remove(&split.page).map(|slot| slot.token);
                if let Some(old) = &old {
                    state.disown(old, token);
                }
                old
            };

            if let Some(old) = released {
                debug!(token = %token, page = %old, "Completed page split");
                self.manager.unsubscribe(&old);
            }
        }
    }

    /// Subscribes both halves of every visible page that asks to be split.
    fn start_splits(&self, token: &PaginatedQueryToken) -> Result<(), LookupError> {
        let (path, args, options, candidates) = {
            let state = self.state.borrow();
            let Some(query) = state.queries.get(token) else {
                return Ok(());
            };
            let candidates: Vec<(PageKey, PageSlot)> = query
                .pages
                .iter()
                .filter(|&&key| !query.is_splitting(key))
                .filter_map(|key| query.slots.get(key).map(|slot| (*key, slot.clone())))
                .collect();
            (query.path.clone(), query.args.clone(), query.options, candidates)
        };

        for (key, slot) in candidates {
            let page = match self.read_page(&slot.token) {
                Ok(Some(page)) => page,
                Ok(None) | Err(LookupError::Function(_)) => continue,
                Err(corrupt) => return Err(corrupt),
            };
            let Some(split_cursor) = page.split_cursor.clone() else {
                continue;
            };
            let oversized = page.page.len() > 2 * slot.bounds.num_items as usize;
            if page.page_status.is_none() && !oversized {
                continue;
            }

            let left = PageBounds {
                cursor: slot.bounds.cursor.clone(),
                end_cursor: Some(split_cursor.clone()),
                num_items: slot.bounds.num_items,
            };
            let right = PageBounds {
                cursor: Some(split_cursor),
                end_cursor: Some(page.continue_cursor.clone()),
                num_items: slot.bounds.num_items,
            };
            let left = match self.subscribe_page(&path, &args, &options, left) {
                Ok(slot) => slot,
                Err(e) => {
                    error!(token = %token, error = %e, "Failed to subscribe split page");
                    continue;
                }
            };
            let right = match self.subscribe_page(&path, &args, &options, right) {
                Ok(slot) => slot,
                Err(e) => {
                    error!(token = %token, error = %e, "Failed to subscribe split page");
                    self.manager.unsubscribe(&left.token);
                    continue;
                }
            };

            let (left_token, right_token) = (left.token.clone(), right.token.clone());
            let recorded = {
                let mut state = self.state.borrow_mut();
                let recorded = match state.queries.get_mut(token) {
                    Some(query) => {
                        let left = query.add_slot(left);
                        let right = query.add_slot(right);
                        query.splits.push(OngoingSplit {
                            page: key,
                            left,
                            right,
                        });
                        true
                    }
                    None => false,
                };
                if recorded {
                    state.own(left_token.clone(), token.clone());
                    state.own(right_token.clone(), token.clone());
                }
                recorded
            };

            if recorded {
                debug!(token = %token, page = %slot.token, "Splitting page");
            } else {
                self.manager.unsubscribe(&left_token);
                self.manager.unsubscribe(&right_token);
            }
        }
        Ok(())
    }
}

fn page_args(args: &Map<String, Value>, options: &PaginationOptions, bounds: &PageBounds) -> Value {
    let mut opts = Map::new();
    opts.insert("numItems".into(), json!(bounds.num_items));
    opts.insert("cursor".into(), json!(bounds.cursor));
    opts.insert("id".into(), json!(options.id()));
    if let Some(end_cursor) = &bounds.end_cursor {
        opts.insert("endCursor".into(), json!(end_cursor));
    }

    let mut page_args = args.clone();
    page_args.insert(PAGINATION_OPTS.into(), Value::Object(opts));
    Value::Object(page_args)
}
