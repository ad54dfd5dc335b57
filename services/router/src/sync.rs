//! Route store synchronization.
//!
//! A [`Syncer`] keeps a listener's in-memory routing table consistent with a
//! [`RouteStore`] using list+watch: open the change stream first, list every
//! route, reconcile the table against the listing, then apply changes in
//! stream order. A watcher that falls behind re-lists with the same diff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use gatehouse_types::{EventType, Route, RouteType};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RouterError;
use crate::store::{RouteStore, RouteStream};

const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// Receiver of reconciled route changes.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Insert or replace a route.
    async fn set(&self, route: Route) -> Result<(), RouterError>;

    /// Remove a route by id.
    async fn remove(&self, id: &str) -> Result<(), RouterError>;

    /// Ids of the routes currently held.
    fn current(&self) -> HashSet<String>;
}

/// Reconciles one route type from a store into a [`SyncHandler`].
#[derive(Clone)]
pub struct Syncer {
    store: Arc<dyn RouteStore>,
    route_type: RouteType,
}

impl Syncer {
    pub fn new(store: Arc<dyn RouteStore>, route_type: RouteType) -> Self {
        Self { store, route_type }
    }

    /// Open the change stream and reconcile `handler` against a full listing.
    ///
    /// The returned stream carries every change made after the listing.
    pub async fn connect<H>(&self, handler: &H) -> Result<RouteStream, RouterError>
    where
        H: SyncHandler + ?Sized,
    {
        let stream = self.store.watch(self.route_type).await?;
        self.full_sync(handler).await?;
        Ok(stream)
    }

    /// Run one synchronization session until `cancel` fires or the stream
    /// fails.
    ///
    /// `started` is signalled once the initial listing has been applied.
    /// Returns `Ok(())` on cancellation; any other return is an error the
    /// caller should retry after a backoff.
    pub async fn sync<H>(
        &self,
        handler: &H,
        started: Option<oneshot::Sender<()>>,
        cancel: &CancellationToken,
    ) -> Result<(), RouterError>
    where
        H: SyncHandler + ?Sized,
    {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = self.connect(handler) => stream?,
        };
        if let Some(started) = started {
            let _ = started.send(());
        }
        self.follow(handler, stream, cancel).await
    }

    /// Apply events from `stream` until cancellation or failure.
    pub async fn follow<H>(
        &self,
        handler: &H,
        mut stream: RouteStream,
        cancel: &CancellationToken,
    ) -> Result<(), RouterError>
    where
        H: SyncHandler + ?Sized,
    {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    let Some(mut route) = event.route else {
                        return Err(RouterError::Store(format!(
                            "{} event without a route",
                            event.event
                        )));
                    };
                    if route.route_type != self.route_type {
                        continue;
                    }
                    match event.event {
                        EventType::Set => {
                            self.hydrate(&mut route).await?;
                            self.apply(handler.set(route)).await?;
                        }
                        EventType::Remove => {
                            let id = route.id;
                            self.apply(handler.remove(&id)).await?;
                        }
                        other => {
                            return Err(RouterError::Store(format!(
                                "unexpected {other} event in route stream"
                            )));
                        }
                    }
                }
                Some(Err(RouterError::TooOld)) => {
                    info!(route_type = %self.route_type, "route stream fell behind, resyncing");
                    self.full_sync(handler).await?;
                }
                Some(Err(e)) => return Err(e),
                None => return Err(RouterError::Store("route stream ended".to_string())),
            }
        }
    }

    /// Keep `handler` synchronized in the background, reconnecting with
    /// backoff after failures.
    ///
    /// `stream` is the stream returned by a prior [`Syncer::connect`].
    pub fn spawn<H>(
        self,
        handler: Arc<H>,
        stream: RouteStream,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        H: SyncHandler + ?Sized + 'static,
    {
        tokio::spawn(async move {
            let mut result = self.follow(&*handler, stream, &cancel).await;
            let mut backoff = RETRY_INITIAL;
            loop {
                match result {
                    Ok(()) => return,
                    Err(e) => error!(route_type = %self.route_type, error = %e, "route sync failed; retrying"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RETRY_MAX);

                let (started_tx, started_rx) = oneshot::channel();
                let session = self.sync(&*handler, Some(started_tx), &cancel);
                tokio::pin!(session);
                result = tokio::select! {
                    result = &mut session => result,
                    Ok(()) = started_rx => {
                        debug!(route_type = %self.route_type, "route sync resumed");
                        backoff = RETRY_INITIAL;
                        session.await
                    }
                };
            }
        })
    }

    async fn full_sync<H>(&self, handler: &H) -> Result<(), RouterError>
    where
        H: SyncHandler + ?Sized,
    {
        let routes = self.store.list(self.route_type).await?;
        let listed: HashSet<&str> = routes.iter().map(|r| r.id.as_str()).collect();

        let stale: Vec<String> = handler
            .current()
            .into_iter()
            .filter(|id| !listed.contains(id.as_str()))
            .collect();
        for id in stale {
            self.apply(handler.remove(&id)).await?;
        }

        let count = routes.len();
        for mut route in routes {
            if route.route_type != self.route_type {
                continue;
            }
            self.hydrate(&mut route).await?;
            self.apply(handler.set(route)).await?;
        }
        debug!(route_type = %self.route_type, count, "routes synchronized");
        Ok(())
    }

    /// Await a handler call, logging and swallowing errors confined to one
    /// route.
    async fn apply(
        &self,
        call: impl std::future::Future<Output = Result<(), RouterError>>,
    ) -> Result<(), RouterError> {
        match call.await {
            Err(e) if e.is_route_scoped() => {
                warn!(route_type = %self.route_type, error = %e, "skipping route");
                Ok(())
            }
            other => other,
        }
    }

    /// Fill in a certificate's private key, which change events omit.
    async fn hydrate(&self, route: &mut Route) -> Result<(), RouterError> {
        let Some(cert) = route.certificate.as_mut() else {
            return Ok(());
        };
        if cert.key.is_empty() && !cert.key_id.is_empty() {
            cert.key = self.store.private_key(&cert.key_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Table {
        routes: Mutex<HashMap<String, Route>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncHandler for Table {
        async fn set(&self, route: Route) -> Result<(), RouterError> {
            if route.service == "broken" {
                return Err(RouterError::Discovery("unreachable".to_string()));
            }
            self.calls.lock().unwrap().push(format!("set {}", route.id));
            self.routes.lock().unwrap().insert(route.id.clone(), route);
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<(), RouterError> {
            self.calls.lock().unwrap().push(format!("remove {id}"));
            self.routes.lock().unwrap().remove(id);
            Ok(())
        }

        fn current(&self) -> HashSet<String> {
            self.routes.lock().unwrap().keys().cloned().collect()
        }
    }

    async fn wait_for(table: &Table, cond: impl Fn(&HashMap<String, Route>) -> bool) {
        for _ in 0..200 {
            if cond(&table.routes.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initial_sync_removes_stale_routes() {
        let store = Arc::new(MemoryStore::new());
        let kept = store.add(Route::tcp(3000, "db")).await.unwrap();

        let table = Table::default();
        table
            .routes
            .lock()
            .unwrap()
            .insert("stale".to_string(), Route::reference(RouteType::Tcp, "stale"));

        let syncer = Syncer::new(store, RouteType::Tcp);
        let _stream = syncer.connect(&table).await.unwrap();

        assert_eq!(table.current(), HashSet::from([kept.id.clone()]));
        let calls = table.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["remove stale".to_string(), format!("set {}", kept.id)]);
    }

    #[tokio::test]
    async fn test_follows_changes_and_signals_start() {
        let store = Arc::new(MemoryStore::new());
        let table = Arc::new(Table::default());
        let cancel = CancellationToken::new();
        let syncer = Syncer::new(store.clone(), RouteType::Http);

        let (started_tx, started_rx) = oneshot::channel();
        let task = {
            let table = table.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { syncer.sync(&*table, Some(started_tx), &cancel).await })
        };
        started_rx.await.unwrap();

        let route = store.add(Route::http("a.example", "web")).await.unwrap();
        // TCP changes are ignored by an HTTP syncer.
        store.add(Route::tcp(3000, "db")).await.unwrap();
        wait_for(&table, |routes| routes.contains_key(&route.id)).await;

        store.remove(RouteType::Http, &route.id).await.unwrap();
        wait_for(&table, |routes| routes.is_empty()).await;

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_route_errors_do_not_stop_sync() {
        let store = Arc::new(MemoryStore::new());
        store.add(Route::tcp(3000, "broken")).await.unwrap();
        let good = store.add(Route::tcp(3001, "db")).await.unwrap();

        let table = Table::default();
        let syncer = Syncer::new(store, RouteType::Tcp);
        syncer.connect(&table).await.unwrap();
        assert_eq!(table.current(), HashSet::from([good.id]));
    }

    #[tokio::test]
    async fn test_lagging_stream_resyncs() {
        let store = Arc::new(MemoryStore::with_event_buffer(1));
        let table = Table::default();
        let syncer = Syncer::new(store.clone(), RouteType::Tcp);
        let stream = syncer.connect(&table).await.unwrap();

        let mut ids = HashSet::new();
        for port in 3000..3004 {
            ids.insert(store.add(Route::tcp(port, "db")).await.unwrap().id);
        }

        let cancel = CancellationToken::new();
        let follow = syncer.follow(&table, stream, &cancel);
        tokio::pin!(follow);
        tokio::select! {
            _ = &mut follow => panic!("sync ended"),
            _ = wait_for(&table, |routes| routes.len() == 4) => {}
        }
        assert_eq!(table.current(), ids);
    }

    #[tokio::test]
    async fn test_spawned_sync_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let table = Arc::new(Table::default());
        let syncer = Syncer::new(store.clone(), RouteType::Tcp);
        let stream = syncer.connect(&*table).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = syncer.spawn(table.clone(), stream, cancel.clone());
        let route = store.add(Route::tcp(3000, "db")).await.unwrap();
        wait_for(&table, |routes| routes.contains_key(&route.id)).await;

        cancel.cancel();
        handle.await.unwrap();
    }
}
