use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mediadrive_core::MEDIA_QUERY;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::media::{MediaKind, RemoteEntry};
use crate::provider::{ProviderError, RemoteFileProvider};

pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(10 * 60);

/// One immutable view of the remote listing.
#[derive(Debug, Default)]
pub struct ListingSnapshot {
    fetched_at: Option<Instant>,
    entries: Vec<RemoteEntry>,
    by_id: HashMap<String, usize>,
}

impl ListingSnapshot {
    fn new(entries: Vec<RemoteEntry>, fetched_at: Instant) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.id.clone(), index))
            .collect();
        Self {
            fetched_at: Some(fetched_at),
            entries,
            by_id,
        }
    }

    pub fn entries(&self) -> &[RemoteEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&RemoteEntry> {
        self.by_id.get(id).map(|index| &self.entries[*index])
    }

    pub fn ids(&self) -> HashSet<String> {
        self.by_id.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `false` until the first successful listing.
    pub fn is_loaded(&self) -> bool {
        self.fetched_at.is_some()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| fetched_at.elapsed() < ttl)
    }
}

/// Result of [`ListingFetcher::list`]. A failed refresh still carries the last
/// good snapshot.
#[derive(Debug)]
pub struct Listing {
    pub snapshot: Arc<ListingSnapshot>,
    pub refreshed: bool,
    pub refresh_error: Option<ProviderError>,
}

pub struct ListingFetcher {
    provider: Arc<dyn RemoteFileProvider>,
    ttl: Duration,
    snapshot: RwLock<Arc<ListingSnapshot>>,
    refresh: Mutex<()>,
}

impl ListingFetcher {
    pub fn new(provider: Arc<dyn RemoteFileProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            snapshot: RwLock::new(Arc::new(ListingSnapshot::default())),
            refresh: Mutex::new(()),
        }
    }

    /// The snapshot currently held, without contacting the provider.
    pub fn current(&self) -> Arc<ListingSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn find(&self, id: &str) -> Option<RemoteEntry> {
        self.current().get(id).cloned()
    }

    pub async fn list(&self, force_refresh: bool) -> Listing {
        if !force_refresh {
            let current = self.current();
            if current.is_fresh(self.ttl) {
                return Listing {
                    snapshot: current,
                    refreshed: false,
                    refresh_error: None,
                };
            }
        }

        let _refreshing = self.refresh.lock().await;
        // Someone else may have refreshed while we waited for the lock.
        if !force_refresh {
            let current = self.current();
            if current.is_fresh(self.ttl) {
                return Listing {
                    snapshot: current,
                    refreshed: false,
                    refresh_error: None,
                };
            }
        }

        match self.provider.list_files(MEDIA_QUERY).await {
            Ok(files) => {
                let total = files.len();
                let entries: Vec<RemoteEntry> = files
                    .into_iter()
                    .filter(|entry| {
                        let supported = MediaKind::classify(&entry.mime_type).is_some();
                        if !supported {
                            debug!(
                                file_id = %entry.id,
                                name = %entry.name,
                                mime_type = %entry.mime_type,
                                "skipping unsupported format"
                            );
                        }
                        supported
                    })
                    .collect();
                info!(total, accepted = entries.len(), "remote listing refreshed");
                let snapshot = Arc::new(ListingSnapshot::new(entries, Instant::now()));
                *self.snapshot.write() = Arc::clone(&snapshot);
                Listing {
                    snapshot,
                    refreshed: true,
                    refresh_error: None,
                }
            }
            Err(err) => Listing {
                snapshot: self.current(),
                refreshed: false,
                refresh_error: Some(err),
            },
        }
    }
}
