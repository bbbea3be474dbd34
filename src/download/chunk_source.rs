//! Body readers for the transfer loop.
//!
//! [`PlainSource`] streams one response body. [`SegmentedSource`] walks the
//! resource with fixed-size ranged requests, for carrier gateways that cut
//! long responses short. Which one a worker uses is decided once per worker
//! by a [`SegmentationPolicy`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Response, StatusCode};
use tracing::{debug, instrument};

use super::client::{HttpClient, TransferRequest};
use super::error::StopRequest;
use super::headers::ResponseMeta;
use crate::record::DownloadStatus;
use crate::system::{NetworkClass, NetworkInfo, SystemFacade};

/// Produces the body of a transfer chunk by chunk.
///
/// Pause and cancel are checked by the caller around every call, so a source
/// only ever has one read in flight.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, or `None` once the resource is complete.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StopRequest`] for transport failures and
    /// unusable segment responses.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StopRequest>;
}

/// Decides whether a worker transfers in fixed-size segments.
pub trait SegmentationPolicy: Send + Sync + fmt::Debug {
    fn use_segments(&self, network: Option<&NetworkInfo>) -> bool;
}

/// Always streams the whole body in one response.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSegment;

impl SegmentationPolicy for NeverSegment {
    fn use_segments(&self, _network: Option<&NetworkInfo>) -> bool {
        false
    }
}

/// Segments on mobile networks whose access-point name is listed.
#[derive(Debug, Clone, Default)]
pub struct AccessPointPolicy {
    access_points: Vec<String>,
}

impl AccessPointPolicy {
    #[must_use]
    pub fn new<I, S>(access_points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            access_points: access_points.into_iter().map(Into::into).collect(),
        }
    }
}

impl SegmentationPolicy for AccessPointPolicy {
    fn use_segments(&self, network: Option<&NetworkInfo>) -> bool {
        let Some(network) = network else {
            return false;
        };
        if network.class != NetworkClass::Mobile {
            return false;
        }
        network.access_point.as_deref().is_some_and(|apn| {
            self.access_points
                .iter()
                .any(|listed| listed.eq_ignore_ascii_case(apn))
        })
    }
}

/// Maps transport failures to a stop, given the attempt's failure budget.
#[derive(Clone)]
pub struct FailureBudget {
    system: Arc<dyn SystemFacade>,
    num_failed: u32,
    max_retries: u32,
}

impl fmt::Debug for FailureBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureBudget")
            .field("num_failed", &self.num_failed)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl FailureBudget {
    #[must_use]
    pub fn new(system: Arc<dyn SystemFacade>, num_failed: u32, max_retries: u32) -> Self {
        Self {
            system,
            num_failed,
            max_retries,
        }
    }

    /// WaitingForNetwork when offline, a counted WaitingToRetry while budget
    /// remains, HttpDataError after that.
    pub fn transport_failure(&self, message: impl Into<String>) -> StopRequest {
        if self.system.active_network().is_none() {
            StopRequest::new(DownloadStatus::WaitingForNetwork, message)
        } else if self.num_failed < self.max_retries {
            StopRequest::counted(DownloadStatus::WaitingToRetry, message)
        } else {
            StopRequest::new(DownloadStatus::HttpDataError, message)
        }
    }
}

/// Streams a single response body.
pub struct PlainSource {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    budget: FailureBudget,
}

impl PlainSource {
    #[must_use]
    pub fn new(response: Response, budget: FailureBudget) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            budget,
        }
    }
}

#[async_trait]
impl ChunkSource for PlainSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StopRequest> {
        match self.stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(self.budget.transport_failure(format!("read failed: {e}"))),
            None => Ok(None),
        }
    }
}

/// Everything needed to issue the follow-up segment requests.
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub etag: Option<String>,
    pub segment_size: u64,
}

/// Walks the resource with ranged requests of `segment_size` bytes.
///
/// The total comes from the first response's `Content-Range`; each later
/// range is clipped so the last one ends at `total - 1`. Without a known
/// total, segments are requested until one comes back short.
pub struct SegmentedSource {
    client: HttpClient,
    plan: SegmentPlan,
    budget: FailureBudget,
    current: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    /// Offset of the next byte to be returned.
    offset: u64,
    /// Exclusive end of the segment in flight.
    segment_end: u64,
    total: Option<u64>,
    short_segment: bool,
    requests: u32,
}

impl SegmentedSource {
    /// Wraps the first segment response, requested from `start`.
    #[must_use]
    pub fn new(
        client: HttpClient,
        plan: SegmentPlan,
        first: Response,
        start: u64,
        total: Option<u64>,
        budget: FailureBudget,
    ) -> Self {
        let segment_end = start.saturating_add(plan.segment_size);
        let segment_end = total.map_or(segment_end, |total| segment_end.min(total));
        Self {
            client,
            plan,
            budget,
            current: Some(first.bytes_stream().boxed()),
            offset: start,
            segment_end,
            total,
            short_segment: false,
            requests: 1,
        }
    }

    /// Number of ranged requests issued so far.
    #[must_use]
    pub fn requests(&self) -> u32 {
        self.requests
    }

    fn finished(&self) -> bool {
        match self.total {
            Some(total) => self.offset >= total,
            None => self.short_segment,
        }
    }

    #[instrument(skip(self), fields(offset = self.offset, total = ?self.total))]
    async fn request_next_segment(&mut self) -> Result<bool, StopRequest> {
        let start = self.offset;
        let mut end = start.saturating_add(self.plan.segment_size).saturating_sub(1);
        if let Some(total) = self.total {
            end = end.min(total.saturating_sub(1));
        }

        let mut request = TransferRequest::new(&self.plan.uri)
            .with_headers(&self.plan.headers)
            .segment(start, end);
        request.if_match = self.plan.etag.as_deref();

        let response = self
            .client
            .send(&request)
            .await
            .map_err(|e| self.budget.transport_failure(format!("segment request failed: {e}")))?;
        self.requests += 1;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && self.total.is_none() {
            debug!(start, "range not satisfiable, treating as end of resource");
            return Ok(false);
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(StopRequest::new(
                DownloadStatus::HttpDataError,
                format!("segment {start}-{end} answered {status}"),
            ));
        }

        let meta = ResponseMeta::from_headers(response.headers());
        if let Some(range) = meta.content_range
            && range.start != start
        {
            return Err(StopRequest::new(
                DownloadStatus::HttpDataError,
                format!("segment {start}-{end} answered range starting at {}", range.start),
            ));
        }

        debug!(start, end, "segment requested");
        self.segment_end = end.saturating_add(1);
        self.current = Some(response.bytes_stream().boxed());
        Ok(true)
    }
}

#[async_trait]
impl ChunkSource for SegmentedSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StopRequest> {
        loop {
            if self.current.is_none()
                && (self.finished() || !self.request_next_segment().await?)
            {
                return Ok(None);
            }
            let Some(stream) = self.current.as_mut() else {
                return Ok(None);
            };

            match stream.next().await {
                Some(Ok(chunk)) => {
                    let remaining = self.segment_end.saturating_sub(self.offset);
                    let len = chunk.len() as u64;
                    if len > remaining {
                        return Err(StopRequest::new(
                            DownloadStatus::HttpDataError,
                            format!("segment overran its range by {} bytes", len - remaining),
                        ));
                    }
                    self.offset += len;
                    return Ok(Some(chunk));
                }
                Some(Err(e)) => {
                    return Err(self.budget.transport_failure(format!("segment read failed: {e}")));
                }
                None => {
                    if self.offset < self.segment_end {
                        if self.total.is_some() {
                            return Err(self.budget.transport_failure(format!(
                                "segment ended at {} before {}",
                                self.offset, self.segment_end
                            )));
                        }
                        self.short_segment = true;
                    }
                    self.current = None;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::system::HostSystem;

    #[test]
    fn test_never_segment() {
        assert!(!NeverSegment.use_segments(Some(&NetworkInfo::mobile(Some("gateway")))));
    }

    #[test]
    fn test_access_point_policy_matches_listed_mobile_apn() {
        let policy = AccessPointPolicy::new(["wap.carrier"]);
        assert!(policy.use_segments(Some(&NetworkInfo::mobile(Some("WAP.carrier")))));
        assert!(!policy.use_segments(Some(&NetworkInfo::mobile(Some("internet")))));
        assert!(!policy.use_segments(Some(&NetworkInfo::mobile(None))));
        assert!(!policy.use_segments(Some(&NetworkInfo::wifi())));
        assert!(!policy.use_segments(None));
    }

    #[test]
    fn test_transport_failure_classification() {
        let online: Arc<dyn SystemFacade> = Arc::new(HostSystem::new());
        let stop = FailureBudget::new(Arc::clone(&online), 0, 2).transport_failure("reset");
        assert_eq!(stop.status, DownloadStatus::WaitingToRetry);
        assert!(stop.count_retry);

        let stop = FailureBudget::new(online, 2, 2).transport_failure("reset");
        assert_eq!(stop.status, DownloadStatus::HttpDataError);
        assert!(!stop.count_retry);

        let offline: Arc<dyn SystemFacade> = Arc::new(HostSystem::with_network(None));
        let stop = FailureBudget::new(offline, 0, 2).transport_failure("reset");
        assert_eq!(stop.status, DownloadStatus::WaitingForNetwork);
    }
}
