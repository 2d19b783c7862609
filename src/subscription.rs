use crate::models::FilterPredicate;
use crate::schema::DataSourceId;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, MissedTickBehavior};

pub type RecomputeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Recompute = Arc<dyn Fn() -> RecomputeFuture + Send + Sync>;

struct Subscription {
    fingerprint: String,
    changed: Arc<Notify>,
    cancelled: Arc<Notify>,
}

// One worker task per subscriber; recomputations are single-flight per
// widget and coalesce on a trailing-edge debounce.
#[derive(Clone)]
pub struct ChangeHub {
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
    debounce: Duration,
}

// Stable identity for "this source filtered this way".
pub fn fingerprint(source: DataSourceId, filters: &[FilterPredicate]) -> String {
    let mut hasher = DefaultHasher::new();
    for predicate in filters {
        predicate.field.hash(&mut hasher);
        serde_json::to_string(&predicate.operator)
            .unwrap_or_default()
            .hash(&mut hasher);
        predicate.value.hash(&mut hasher);
    }
    format!("{}:{:016x}", source.as_str(), hasher.finish())
}

fn source_prefix(fingerprint: &str) -> &str {
    fingerprint.split(':').next().unwrap_or(fingerprint)
}

impl ChangeHub {
    pub fn new(debounce: Duration) -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            debounce,
        }
    }

    // Re-subscribing an existing widget id replaces and cancels the
    // previous worker.
    pub async fn subscribe(
        &self,
        widget_id: &str,
        fingerprint: String,
        refresh_interval: Option<Duration>,
        recompute: Recompute,
    ) {
        let changed = Arc::new(Notify::new());
        let cancelled = Arc::new(Notify::new());

        {
            let mut subs = self.subscriptions.lock().await;
            if let Some(previous) = subs.insert(
                widget_id.to_string(),
                Subscription {
                    fingerprint,
                    changed: changed.clone(),
                    cancelled: cancelled.clone(),
                },
            ) {
                previous.cancelled.notify_one();
            }
        }

        let debounce = self.debounce;
        let widget_id = widget_id.to_string();
        tokio::spawn(async move {
            run_worker(widget_id, debounce, refresh_interval, changed, cancelled, recompute).await;
        });
    }

    pub async fn unsubscribe(&self, widget_id: &str) {
        let mut subs = self.subscriptions.lock().await;
        if let Some(subscription) = subs.remove(widget_id) {
            subscription.cancelled.notify_one();
        }
    }

    pub async fn publish(&self, source: DataSourceId) {
        let subs = self.subscriptions.lock().await;
        for subscription in subs.values() {
            if source_prefix(&subscription.fingerprint) == source.as_str() {
                subscription.changed.notify_one();
            }
        }
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

async fn run_worker(
    widget_id: String,
    debounce: Duration,
    refresh_interval: Option<Duration>,
    changed: Arc<Notify>,
    cancelled: Arc<Notify>,
    recompute: Recompute,
) {
    let mut timer = tokio::time::interval(refresh_interval.unwrap_or(Duration::from_secs(3600)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await; // discard the immediate first tick
    let timer_enabled = refresh_interval.is_some();

    loop {
        tokio::select! {
            _ = cancelled.notified() => break,
            _ = changed.notified() => {
                // Trailing-edge debounce: let a burst of change events settle
                // into a single recomputation. A notification arriving while
                // the recompute runs leaves one stored permit, which is
                // exactly one follow-up pass.
                let work = async {
                    tokio::time::sleep(debounce).await;
                    recompute().await;
                };
                tokio::select! {
                    _ = cancelled.notified() => break,
                    _ = work => {}
                }
            }
            _ = timer.tick(), if timer_enabled => {
                tokio::select! {
                    _ = cancelled.notified() => break,
                    _ = recompute() => {}
                }
            }
        }
    }
    tracing::debug!(widget_id = %widget_id, "widget subscription worker stopped");
}
