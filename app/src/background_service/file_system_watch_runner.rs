use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use domain::service::BackgroundService;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::Instrument;
use uuid::Uuid;

use crate::infrastructure::service::controller::{JobController, WatchEvent, WatchEventKind};

/// Watches every source root of watcher-enabled jobs and feeds classified
/// events into the controller, which updates the catalogue online without a
/// full rescan.
pub struct FileSystemWatchRunner {
    controller: Arc<JobController>,
}

#[async_trait::async_trait]
impl BackgroundService for FileSystemWatchRunner {
    async fn run(&self) {
        let watched: Vec<(Uuid, PathBuf)> = self
            .controller
            .job_ids()
            .into_iter()
            .filter_map(|id| self.controller.job_config(id).map(|c| (id, c)))
            .filter(|(_, config)| config.watcher)
            .flat_map(|(id, config)| {
                config.sources.iter().map(move |s| (id, PathBuf::from(s))).collect::<Vec<_>>()
            })
            .collect();
        if watched.is_empty() {
            return;
        }

        let (sender, receiver): (
            flume::Sender<notify::Result<Event>>,
            flume::Receiver<notify::Result<Event>>,
        ) = flume::unbounded();
        let mut watcher = match PollWatcher::new(
            FlumeEventHandler(sender),
            Config::default().with_poll_interval(Duration::from_secs(2)),
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!("Unable to start file watcher: {e}");
                return;
            }
        };
        for (_, root) in &watched {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                tracing::error!(root = %root.display(), "Unable to watch source root: {e}");
            }
        }

        loop {
            match receiver.recv_async().await {
                Ok(Ok(event)) => {
                    tracing::trace!("{event:?}");
                    let Some(watch_event) = classify(&event) else { continue };
                    for (job_id, root) in &watched {
                        if !watch_event.path.starts_with(root) {
                            continue;
                        }
                        let controller = self.controller.clone();
                        let job_id = *job_id;
                        let watch_event = watch_event.clone();
                        tokio::spawn(
                            async move {
                                controller.on_watch_event(job_id, watch_event).await;
                            }
                            .instrument(tracing::trace_span!("file_watcher_event")),
                        );
                    }
                }
                Ok(Err(e)) => tracing::error!("Watcher error: {e}"),
                Err(e) => {
                    tracing::error!("Watcher receive event error: {e}");
                    return;
                }
            }
        }
    }
}

impl FileSystemWatchRunner {
    pub fn new(controller: Arc<JobController>) -> Self {
        Self { controller }
    }
}

/// Reduce a notify event to the create/change/rename/delete contract.
/// Coalesced or unclassifiable events fall back to `Change` when they name
/// a path, so the catalogue converges on the filesystem's final state.
fn classify(event: &Event) -> Option<WatchEvent> {
    let path = event.paths.last()?.clone();
    let (kind, old_path) = match event.kind {
        EventKind::Create(_) => (WatchEventKind::Create, None),
        EventKind::Remove(_) => (WatchEventKind::Delete, None),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            let old = (event.paths.len() > 1).then(|| event.paths[0].clone());
            (WatchEventKind::Rename, old)
        }
        EventKind::Modify(_) | EventKind::Any => (WatchEventKind::Change, None),
        EventKind::Access(_) | EventKind::Other => return None,
    };
    Some(WatchEvent {
        kind,
        path,
        old_path,
    })
}

struct FlumeEventHandler(flume::Sender<notify::Result<Event>>);

impl notify::EventHandler for FlumeEventHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Err(e) = self.0.send(event) {
            tracing::error!("File watcher send event error. {e}")
        }
    }
}
