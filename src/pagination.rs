//! Cursor-based iteration over multi-page endpoints.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::Stream;
use serde::de::DeserializeOwned;

use crate::action::RestAction;
use crate::error::RestError;
use crate::route::CompiledRoute;
use crate::runtime::RestRuntime;

type KeyFn<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;
type RouteFn = Box<dyn Fn(u64, u32) -> Result<CompiledRoute, RestError> + Send + Sync>;

/// Iterator over a cursor-paged endpoint returning JSON arrays of `T`.
///
/// Each page request is produced by the route producer from the current
/// cursor (`0` before anything was fetched) and the page limit. Entities
/// carry a `u64` key (newest first, as snowflake-keyed APIs page); the
/// paginator tracks the last seen key as its cursor and optionally caches
/// every seen entity.
///
/// # Example
///
/// ```rust,no_run
/// use restflow::{Paginator, RestRuntime, Route};
/// # use serde_json::Value;
///
/// # async fn demo(runtime: RestRuntime) -> Result<(), restflow::RestError> {
/// let route = Route::get("channels/{channel_id}/messages")?;
/// let compiled = route.compile(&["111"])?;
/// let mut messages: Paginator<Value> = Paginator::new(
///     &runtime,
///     1,
///     100,
///     50,
///     |message: &Value| message["id"].as_str().unwrap_or("0").parse().unwrap_or(0),
///     move |cursor, limit| {
///         let mut page = compiled.with_query_params(&[("limit", &limit.to_string())])?;
///         if cursor != 0 {
///             page = page.with_query_params(&[("before", &cursor.to_string())])?;
///         }
///         Ok(page)
///     },
/// );
///
/// let first_hundred = messages.take_remaining(100).await?;
/// # Ok(())
/// # }
/// ```
pub struct Paginator<T> {
    runtime: RestRuntime,
    route_fn: RouteFn,
    key_fn: KeyFn<T>,
    cached: Vec<T>,
    iterator_index: u64,
    last_key: u64,
    last: Option<T>,
    use_cache: bool,
    limit: u32,
    min_limit: u32,
    max_limit: u32,
}

impl<T> Paginator<T>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    /// Create a paginator.
    ///
    /// `key_fn` extracts the cursor key of an entity; `route_fn` builds the
    /// page request from `(cursor, limit)` where cursor `0` means "from the
    /// start".
    pub fn new(
        runtime: &RestRuntime,
        min_limit: u32,
        max_limit: u32,
        initial_limit: u32,
        key_fn: impl Fn(&T) -> u64 + Send + Sync + 'static,
        route_fn: impl Fn(u64, u32) -> Result<CompiledRoute, RestError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            runtime: runtime.clone(),
            route_fn: Box::new(route_fn),
            key_fn: Arc::new(key_fn),
            cached: Vec::new(),
            iterator_index: 0,
            last_key: 0,
            last: None,
            use_cache: true,
            limit: initial_limit,
            min_limit,
            max_limit,
        }
    }

    /// Set the page size used for subsequent fetches.
    pub fn limit(&mut self, limit: u32) -> Result<&mut Self, RestError> {
        if self.max_limit > 0 && limit > self.max_limit {
            return Err(RestError::InvalidArgument(format!(
                "limit must not exceed {}",
                self.max_limit
            )));
        }
        if self.min_limit > 0 && limit < self.min_limit {
            return Err(RestError::InvalidArgument(format!(
                "limit must be greater or equal to {}",
                self.min_limit
            )));
        }
        self.limit = limit;
        Ok(self)
    }

    /// Enable or disable the local cache of seen entities.
    pub fn cache(&mut self, enabled: bool) -> &mut Self {
        self.use_cache = enabled;
        self
    }

    /// Jump the cursor to the given key.
    ///
    /// Rejected when entities are cached and `id` is newer than the current
    /// oldest key (unsigned comparison); the paginator only moves backwards
    /// through already-fetched territory.
    pub fn skip_to(&mut self, id: u64) -> Result<&mut Self, RestError> {
        if !self.cached.is_empty() && self.last_key < id {
            return Err(RestError::InvalidArgument(
                "cannot jump to that id, it is newer than the current oldest element".into(),
            ));
        }
        if self.last_key != id {
            self.last = None;
        }
        self.iterator_index = id;
        self.last_key = id;
        Ok(self)
    }

    /// The most recently observed cursor key (0 before any fetch).
    pub fn last_key(&self) -> u64 {
        self.last_key
    }

    /// The first cached entity.
    pub fn first(&self) -> Option<&T> {
        self.cached.first()
    }

    /// The entity behind [`last_key`](Paginator::last_key), when known.
    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    /// All cached entities, in receipt order.
    pub fn cached(&self) -> &[T] {
        &self.cached
    }

    /// Number of cached entities.
    pub fn cache_size(&self) -> usize {
        self.cached.len()
    }

    /// Whether the cache holds nothing yet.
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }

    /// Whether caching is enabled.
    pub fn is_cache_enabled(&self) -> bool {
        self.use_cache
    }

    /// The configured page size.
    pub fn get_limit(&self) -> u32 {
        self.limit
    }

    /// The inclusive maximum page size (0 = unbounded).
    pub fn max_limit(&self) -> u32 {
        self.max_limit
    }

    /// The inclusive minimum page size (0 = unbounded).
    pub fn min_limit(&self) -> u32 {
        self.min_limit
    }

    /// Position in the cache just past the cursor entity.
    ///
    /// `None` when the cursor key is not cached: strictly "not found",
    /// never a sentinel.
    fn cached_position(&self) -> Option<usize> {
        self.cached
            .iter()
            .position(|entity| (self.key_fn)(entity) == self.iterator_index)
            .map(|position| position + 1)
    }

    /// Cached entities after the cursor, when the cache covers it.
    fn remaining_cache(&self) -> &[T] {
        if !self.use_cache {
            return &[];
        }
        match self.cached_position() {
            Some(position) if position < self.cached.len() => &self.cached[position..],
            _ => &[],
        }
    }

    /// Rewind/advance the cursor onto the given entity.
    fn update_index(&mut self, entity: &T) {
        let key = (self.key_fn)(entity);
        self.iterator_index = key;
        if !self.use_cache {
            self.last_key = key;
            self.last = Some(entity.clone());
        }
    }

    async fn fetch_page(&mut self) -> Result<Vec<T>, RestError> {
        let route = (self.route_fn)(self.iterator_index, self.limit)?;
        let page: Vec<T> = RestAction::request_json(&self.runtime, route, None)
            .submit()
            .await?;

        if self.use_cache {
            self.cached.extend(page.iter().cloned());
        }
        if let Some(last_entity) = page.last() {
            let key = (self.key_fn)(last_entity);
            self.last_key = key;
            self.last = Some(last_entity.clone());
            self.iterator_index = key;
        }
        Ok(page)
    }

    /// The next chunk of entities: cached entries past the cursor when
    /// available, otherwise a freshly fetched page. Empty when exhausted.
    ///
    /// The cursor advances past everything returned.
    pub async fn next_page(&mut self) -> Result<Vec<T>, RestError> {
        let remaining = self.remaining_cache().to_vec();
        if !remaining.is_empty() {
            if let Some(last_entity) = remaining.last() {
                self.iterator_index = (self.key_fn)(last_entity);
            }
            return Ok(remaining);
        }
        self.fetch_page().await
    }

    /// Visit every remaining entity; return `false` from `action` to stop.
    ///
    /// Stopping records the entity as the resume cursor, so the next call
    /// continues right after it.
    pub async fn for_each_remaining(
        &mut self,
        mut action: impl FnMut(&T) -> bool,
    ) -> Result<(), RestError> {
        loop {
            let chunk = self.next_page().await?;
            if chunk.is_empty() {
                return Ok(());
            }
            for entity in &chunk {
                if !action(entity) {
                    self.update_index(entity);
                    return Ok(());
                }
            }
        }
    }

    /// Collect up to `amount` entities starting from the top of the cache.
    pub async fn take(&mut self, amount: usize) -> Result<Vec<T>, RestError> {
        let mut collected: Vec<T> = self.cached.iter().take(amount).cloned().collect();
        if let Some(last_entity) = collected.last() {
            self.update_index(&last_entity.clone());
        }
        while collected.len() < amount {
            let page = self.next_page().await?;
            if page.is_empty() {
                break;
            }
            collected.extend(page.into_iter().take(amount - collected.len()));
        }
        Ok(collected)
    }

    /// Collect up to `amount` entities past the current cursor.
    pub async fn take_remaining(&mut self, amount: usize) -> Result<Vec<T>, RestError> {
        let mut collected = Vec::with_capacity(amount.min(64));
        self.for_each_remaining(|entity| {
            collected.push(entity.clone());
            collected.len() < amount
        })
        .await?;
        Ok(collected)
    }

    /// All remaining entities as an async stream.
    pub fn stream(&mut self) -> impl Stream<Item = Result<T, RestError>> + Send + '_ {
        futures_util::stream::unfold(
            (self, VecDeque::<T>::new(), false),
            |(paginator, mut buffer, exhausted)| async move {
                if let Some(next) = buffer.pop_front() {
                    return Some((Ok(next), (paginator, buffer, exhausted)));
                }
                if exhausted {
                    return None;
                }
                match paginator.next_page().await {
                    Ok(chunk) if chunk.is_empty() => None,
                    Ok(chunk) => {
                        buffer.extend(chunk);
                        let next = buffer.pop_front()?;
                        Some((Ok(next), (paginator, buffer, false)))
                    }
                    Err(error) => Some((Err(error), (paginator, buffer, true))),
                }
            },
        )
    }
}

impl<T> std::fmt::Debug for Paginator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("iterator_index", &self.iterator_index)
            .field("last_key", &self.last_key)
            .field("cached", &self.cached.len())
            .field("use_cache", &self.use_cache)
            .field("limit", &self.limit)
            .finish()
    }
}
