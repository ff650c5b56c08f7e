use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::ReaderError;
use crate::page::{PageDescriptor, PageStatus};
use crate::SessionToken;

#[async_trait::async_trait]
pub trait SizeProbe: Send + Sync {
    async fn probe_size(&self, url: &str) -> Result<(u32, u32)>;
}

#[async_trait::async_trait]
impl<P: SizeProbe + ?Sized> SizeProbe for Arc<P> {
    async fn probe_size(&self, url: &str) -> Result<(u32, u32)> {
        (**self).probe_size(url).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub index: usize,
    pub url: String,
}

impl PageRequest {
    pub fn pending(pages: &[PageDescriptor]) -> Vec<PageRequest> {
        pages
            .iter()
            .filter(|page| !page.status.is_settled())
            .map(|page| PageRequest {
                index: page.index,
                url: page.url.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionUpdate {
    pub session: SessionToken,
    pub index: usize,
    pub status: PageStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub resolved: usize,
    pub failed: usize,
    pub batches: usize,
}

impl ResolveSummary {
    fn record(&mut self, status: PageStatus) {
        match status {
            PageStatus::Resolved { .. } => self.resolved += 1,
            PageStatus::Failed => self.failed += 1,
            PageStatus::Pending => {}
        }
    }
}

/// Probes pages in consecutive batches of at most `concurrency` requests.
/// A batch is awaited in full before the next one is issued.
pub struct DimensionResolver<P> {
    probe: P,
    concurrency: usize,
    probe_timeout: Duration,
}

impl<P: SizeProbe> DimensionResolver<P> {
    pub fn new(probe: P, concurrency: usize, probe_timeout: Duration) -> Self {
        Self {
            probe,
            concurrency: concurrency.max(1),
            probe_timeout,
        }
    }

    pub fn from_config(probe: P, config: &PipelineConfig) -> Self {
        Self::new(probe, config.probe_concurrency, config.probe_timeout)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[instrument(skip_all, fields(pages = pages.len()))]
    pub async fn resolve(&self, pages: &mut [PageDescriptor]) -> ResolveSummary {
        let mut summary = ResolveSummary::default();
        let unsettled: Vec<usize> = (0..pages.len())
            .filter(|&slot| !pages[slot].status.is_settled())
            .collect();
        for batch in unsettled.chunks(self.concurrency) {
            let requests: Vec<PageRequest> = batch
                .iter()
                .map(|&slot| PageRequest {
                    index: pages[slot].index,
                    url: pages[slot].url.clone(),
                })
                .collect();
            let statuses = join_all(
                requests
                    .iter()
                    .map(|request| self.probe_page(request.index, &request.url)),
            )
            .await;
            for (&slot, status) in batch.iter().zip(statuses) {
                if pages[slot].settle(status) {
                    summary.record(pages[slot].status);
                }
            }
            summary.batches += 1;
        }
        summary
    }

    /// Resolves `requests` and sends each settled batch to `updates`.
    ///
    /// Stops before issuing the next batch once the receiving session is gone.
    #[instrument(skip_all, fields(%session, pages = requests.len()))]
    pub async fn stream(
        &self,
        session: SessionToken,
        requests: Vec<PageRequest>,
        updates: mpsc::UnboundedSender<Vec<DimensionUpdate>>,
    ) -> ResolveSummary {
        let mut summary = ResolveSummary::default();
        for batch in requests.chunks(self.concurrency) {
            if updates.is_closed() {
                debug!("session closed, abandoning remaining batches");
                break;
            }
            let statuses = join_all(
                batch
                    .iter()
                    .map(|request| self.probe_page(request.index, &request.url)),
            )
            .await;
            let settled: Vec<DimensionUpdate> = batch
                .iter()
                .zip(statuses)
                .map(|(request, status)| {
                    summary.record(status);
                    DimensionUpdate {
                        session,
                        index: request.index,
                        status,
                    }
                })
                .collect();
            summary.batches += 1;
            if updates.send(settled).is_err() {
                debug!("session closed while batch was in flight");
                break;
            }
        }
        summary
    }

    async fn probe_page(&self, index: usize, url: &str) -> PageStatus {
        let outcome = match timeout(self.probe_timeout, self.probe.probe_size(url)).await {
            Ok(Ok((width, height))) if width > 0 && height > 0 => {
                return PageStatus::Resolved { width, height };
            }
            Ok(Ok((width, height))) => format!("probe reported {width}x{height}"),
            Ok(Err(err)) => format!("{err:#}"),
            Err(_) => format!("timed out after {}ms", self.probe_timeout.as_millis()),
        };
        let err = ReaderError::DimensionProbeFailed {
            index,
            url: url.to_owned(),
            reason: outcome,
        };
        warn!(error = %err, "using fallback geometry");
        PageStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use uuid::Uuid;

    struct ScriptedProbe {
        sizes: HashMap<String, Option<(u32, u32)>>,
        delays_ms: HashMap<String, u64>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        issued: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(sizes: Vec<(&str, Option<(u32, u32)>)>) -> Self {
            let mut rng = rand::thread_rng();
            let mut delays: Vec<u64> = (0..sizes.len() as u64).map(|d| d * 3).collect();
            delays.shuffle(&mut rng);
            let delays_ms = sizes
                .iter()
                .zip(delays)
                .map(|((url, _), delay)| (url.to_string(), delay + rng.gen_range(0..3)))
                .collect();
            Self {
                sizes: sizes
                    .into_iter()
                    .map(|(url, size)| (url.to_string(), size))
                    .collect(),
                delays_ms,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                issued: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl SizeProbe for ScriptedProbe {
        async fn probe_size(&self, url: &str) -> Result<(u32, u32)> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = self.delays_ms.get(url).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.sizes
                .get(url)
                .copied()
                .flatten()
                .ok_or_else(|| anyhow!("decode failed for {url}"))
        }
    }

    fn pages(urls: &[&str]) -> Vec<PageDescriptor> {
        urls.iter()
            .enumerate()
            .map(|(i, url)| PageDescriptor::pending(i, url.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn output_keeps_manifest_order_under_shuffled_completion() {
        let urls: Vec<String> = (0..23).map(|i| format!("p{i}.jpg")).collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let probe = ScriptedProbe::new(
            url_refs
                .iter()
                .enumerate()
                .map(|(i, url)| (*url, Some((100 + i as u32, 200))))
                .collect(),
        );
        let resolver = DimensionResolver::new(probe, 5, Duration::from_secs(5));
        let mut sequence = pages(&url_refs);

        let summary = resolver.resolve(&mut sequence).await;

        assert_eq!(summary.resolved, 23);
        assert_eq!(summary.batches, 5);
        assert_eq!(sequence.len(), 23);
        for (i, page) in sequence.iter().enumerate() {
            assert_eq!(page.index, i);
            assert_eq!(
                page.status,
                PageStatus::Resolved {
                    width: 100 + i as u32,
                    height: 200
                }
            );
        }
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_cap() {
        let urls: Vec<String> = (0..17).map(|i| format!("p{i}.png")).collect();
        let probe = Arc::new(ScriptedProbe::new(
            urls.iter().map(|u| (u.as_str(), Some((10, 10)))).collect(),
        ));
        let resolver = DimensionResolver::new(Arc::clone(&probe), 3, Duration::from_secs(5));
        let mut sequence = pages(&urls.iter().map(String::as_str).collect::<Vec<_>>());

        resolver.resolve(&mut sequence).await;

        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(probe.issued.load(Ordering::SeqCst), 17);
    }

    #[tokio::test]
    async fn resolve_skips_settled_pages() {
        let urls: Vec<String> = (0..6).map(|i| format!("p{i}.png")).collect();
        let probe = Arc::new(ScriptedProbe::new(
            urls.iter().map(|u| (u.as_str(), Some((10, 20)))).collect(),
        ));
        let resolver = DimensionResolver::new(Arc::clone(&probe), 5, Duration::from_secs(5));
        let mut sequence = pages(&urls.iter().map(String::as_str).collect::<Vec<_>>());
        sequence[1].settle(PageStatus::Failed);
        sequence[4].settle(PageStatus::Resolved {
            width: 3,
            height: 4,
        });

        let summary = resolver.resolve(&mut sequence).await;

        assert_eq!(probe.issued.load(Ordering::SeqCst), 4);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.resolved, 4);
        assert_eq!(sequence[1].status, PageStatus::Failed);
        assert_eq!(
            sequence[4].status,
            PageStatus::Resolved {
                width: 3,
                height: 4
            }
        );
        assert!(sequence.iter().all(|page| page.status.is_settled()));
    }

    #[tokio::test]
    async fn failures_and_timeouts_fall_back() {
        struct SlowProbe;

        #[async_trait::async_trait]
        impl SizeProbe for SlowProbe {
            async fn probe_size(&self, url: &str) -> Result<(u32, u32)> {
                match url {
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok((1, 1))
                    }
                    "zero" => Ok((0, 0)),
                    "bad" => Err(anyhow!("404")),
                    _ => Ok((3, 4)),
                }
            }
        }

        let resolver = DimensionResolver::new(SlowProbe, 2, Duration::from_millis(20));
        let mut sequence = pages(&["ok", "slow", "zero", "bad"]);
        let summary = resolver.resolve(&mut sequence).await;

        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.failed, 3);
        let statuses: Vec<_> = sequence.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            [
                PageStatus::Resolved {
                    width: 3,
                    height: 4
                },
                PageStatus::Failed,
                PageStatus::Failed,
                PageStatus::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn stream_tags_updates_and_sends_per_batch() {
        let probe = ScriptedProbe::new(vec![
            ("a.png", Some((800, 1200))),
            ("b.png", None),
            ("c.png", Some((1000, 1000))),
        ]);
        let resolver = DimensionResolver::new(probe, 2, Duration::from_secs(5));
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let requests = PageRequest::pending(&pages(&["a.png", "b.png", "c.png"]));

        let summary = resolver.stream(session, requests, tx).await;

        assert_eq!(summary.batches, 2);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().chain(&second).all(|u| u.session == session));
        assert_eq!(first[1].status, PageStatus::Failed);
        assert_eq!(second[0].index, 2);
    }

    #[tokio::test]
    async fn stream_stops_when_session_is_gone() {
        let urls: Vec<String> = (0..10).map(|i| format!("{i}.png")).collect();
        let probe = Arc::new(ScriptedProbe::new(
            urls.iter().map(|u| (u.as_str(), Some((5, 5)))).collect(),
        ));
        let resolver = DimensionResolver::new(Arc::clone(&probe), 4, Duration::from_secs(5));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let requests = PageRequest::pending(&pages(
            &urls.iter().map(String::as_str).collect::<Vec<_>>(),
        ));

        let summary = resolver.stream(Uuid::new_v4(), requests, tx).await;

        assert_eq!(summary.batches, 0);
        assert_eq!(probe.issued.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pending_requests_skip_settled_pages() {
        let mut sequence = pages(&["a", "b", "c"]);
        sequence[1].settle(PageStatus::Failed);
        let requests = PageRequest::pending(&sequence);
        let indices: Vec<_> = requests.iter().map(|r| r.index).collect();
        assert_eq!(indices, [0, 2]);
    }
}
