use dashmap::DashMap;
use std::{
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tareas diferidas y cancelables indexadas por clave.
///
/// Programar una clave ya programada cancela la tarea anterior.
pub struct TaskScheduler<K> {
    tasks: Arc<DashMap<K, (u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl<K> Default for TaskScheduler<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TaskScheduler<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        if let Some((_, previous)) = self.tasks.insert(key.clone(), (id, token.clone())) {
            previous.cancel();
        }

        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("⏱️ Tarea cancelada para {:?}", key);
                }
                _ = tokio::time::sleep(delay) => {
                    // Sólo se retira la entrada si sigue siendo la nuestra
                    tasks.remove_if(&key, |_, (current, _)| *current == id);
                    task.await;
                }
            }
        });
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some((_, (_, token))) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn cancel_all(&self) {
        for entry in self.tasks.iter() {
            entry.value().1.cancel();
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(1u64, Duration::from_secs(60), counter_task(&counter));
        assert!(scheduler.is_scheduled(&1));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tasks_never_run() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("room", Duration::from_secs(5), counter_task(&counter));
        assert!(scheduler.cancel(&"room"));
        assert!(!scheduler.cancel(&"room"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous_task() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(7u64, Duration::from_secs(5), counter_task(&counter));
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.schedule(7u64, Duration::from_secs(5), counter_task(&counter));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_everything() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for key in 0..3u64 {
            scheduler.schedule(key, Duration::from_secs(1), counter_task(&counter));
        }
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
