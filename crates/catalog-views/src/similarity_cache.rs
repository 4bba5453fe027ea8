/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

//! Bounded TTL cache of similarity results keyed by (subject, k).
//!
//! Entries are never served past their expiry. Expired entries are evicted lazily on lookup, or in
//! bulk when an insert finds the cache full.

use crate::ArtistId;
use crate::Config;
use crate::similarity::Scored;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;
use tracing::debug;
use tracing::debug_span;
use tracing::trace;

type GetR = Option<Scored>;

pub(crate) enum SimilarityCache {
    Get {
        id: ArtistId,
        k: usize,
        tx: oneshot::Sender<GetR>,
    },
    Put {
        id: ArtistId,
        k: usize,
        scored: Scored,
    },
}

pub(crate) trait SimilarityCacheExt {
    async fn get(&self, id: ArtistId, k: usize) -> GetR;
    async fn put(&self, id: ArtistId, k: usize, scored: Scored);
}

impl SimilarityCacheExt for mpsc::Sender<SimilarityCache> {
    async fn get(&self, id: ArtistId, k: usize) -> GetR {
        let (tx, rx) = oneshot::channel();
        self.send(SimilarityCache::Get { id, k, tx })
            .await
            .expect("SimilarityCacheExt::get: internal actor should receive request");
        rx.await
            .expect("SimilarityCacheExt::get: internal actor should send response")
    }

    async fn put(&self, id: ArtistId, k: usize, scored: Scored) {
        self.send(SimilarityCache::Put { id, k, scored })
            .await
            .expect("SimilarityCacheExt::put: internal actor should receive request");
    }
}

type EntriesT = HashMap<(ArtistId, usize), (Instant, Scored)>;

pub(crate) fn new(config_rx: watch::Receiver<Arc<Config>>) -> mpsc::Sender<SimilarityCache> {
    let (tx, mut rx) = mpsc::channel(100);

    tokio::spawn(
        async move {
            debug!("starting");

            let mut entries = EntriesT::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    SimilarityCache::Get { id, k, tx } => get(id, k, tx, &mut entries),
                    SimilarityCache::Put { id, k, scored } => {
                        let config = config_rx.borrow().clone();
                        put(id, k, scored, &config, &mut entries);
                    }
                }
            }

            debug!("finished");
        }
        .instrument(debug_span!("similarity-cache")),
    );

    tx
}

fn get(id: ArtistId, k: usize, tx: oneshot::Sender<GetR>, entries: &mut EntriesT) {
    let key = (id, k);
    let scored = match entries.get(&key) {
        Some((expires_at, scored)) if *expires_at > Instant::now() => Some(scored.clone()),
        Some(_) => {
            trace!("get: entry for {} expired", key.0);
            entries.remove(&key);
            None
        }
        None => None,
    };
    tx.send(scored)
        .unwrap_or_else(|_| trace!("get: unable to send response"));
}

fn put(id: ArtistId, k: usize, scored: Scored, config: &Config, entries: &mut EntriesT) {
    let capacity = config.similar_cache_capacity;
    if capacity == 0 {
        return;
    }
    let key = (id, k);
    let now = Instant::now();
    if !entries.contains_key(&key) && entries.len() >= capacity {
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        if entries.len() >= capacity {
            let soonest = entries
                .iter()
                .min_by_key(|(_, (expires_at, _))| *expires_at)
                .map(|(key, _)| key.clone());
            if let Some(soonest) = soonest {
                debug!("put: cache full, evicting entry for {}", soonest.0);
                entries.remove(&soonest);
            }
        }
    }
    entries.insert(key, (now + config.similar_cache_ttl, scored));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::Subject;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn scored(id: &str) -> Scored {
        Scored {
            subject: Subject {
                id: id.into(),
                name: None,
                image_url: None,
            },
            items: Vec::new(),
            scored_at: OffsetDateTime::now_utc(),
        }
    }

    fn cache(ttl: Duration, capacity: usize) -> mpsc::Sender<SimilarityCache> {
        let (_, config_rx) = watch::channel(Arc::new(Config {
            similar_cache_ttl: ttl,
            similar_cache_capacity: capacity,
            ..Default::default()
        }));
        new(config_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_until_expiry() {
        let cache = cache(Duration::from_secs(60), 10);
        let value = scored("a");
        cache.put("a".into(), 2, value.clone()).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("a".into(), 2).await, Some(value));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("a".into(), 2).await, None);
    }

    #[tokio::test]
    async fn key_includes_k() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.put("a".into(), 2, scored("a")).await;

        assert!(cache.get("a".into(), 2).await.is_some());
        assert!(cache.get("a".into(), 3).await.is_none());
        assert!(cache.get("b".into(), 2).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_drops_expired_then_soonest_expiring() {
        let (config_tx, config_rx) = watch::channel(Arc::new(Config {
            similar_cache_ttl: Duration::from_secs(10),
            similar_cache_capacity: 2,
            ..Default::default()
        }));
        let cache = new(config_rx);

        cache.put("a".into(), 1, scored("a")).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.put("b".into(), 1, scored("b")).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        // "a" expires first, so it is evicted for "c"
        cache.put("c".into(), 1, scored("c")).await;
        assert!(cache.get("a".into(), 1).await.is_none());
        assert!(cache.get("b".into(), 1).await.is_some());
        assert!(cache.get("c".into(), 1).await.is_some());

        // a longer ttl applies to new entries only
        config_tx.send_modify(|config| {
            let mut updated = (**config).clone();
            updated.similar_cache_ttl = Duration::from_secs(100);
            *config = Arc::new(updated);
        });
        tokio::time::advance(Duration::from_secs(10)).await;
        cache.put("d".into(), 1, scored("d")).await;
        cache.put("e".into(), 1, scored("e")).await;
        assert!(cache.get("b".into(), 1).await.is_none());
        assert!(cache.get("c".into(), 1).await.is_none());
        assert!(cache.get("d".into(), 1).await.is_some());
        assert!(cache.get("e".into(), 1).await.is_some());
    }

    #[tokio::test]
    async fn zero_capacity_disables_cache() {
        let cache = cache(Duration::from_secs(60), 0);
        cache.put("a".into(), 2, scored("a")).await;

        assert!(cache.get("a".into(), 2).await.is_none());
    }
}
