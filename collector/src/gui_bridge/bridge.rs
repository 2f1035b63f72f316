use crate::gui_bridge::model::{LayoutModel, StatusModel};
use anyhow::Context;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trackcore::AggregatorHandle;
use warp::Filter;

#[derive(Debug)]
struct AggregatorUnavailable;

impl warp::reject::Reject for AggregatorUnavailable {}

/// Read-only HTTP view over the running aggregator.
pub struct StatusBridge {
    addr: SocketAddr,
    layout: LayoutModel,
}

impl StatusBridge {
    pub fn new(addr: SocketAddr, layout: LayoutModel) -> Self {
        Self { addr, layout }
    }

    /// `GET /locations`, `GET /archive` and `GET /status`.
    pub fn routes(
        handle: AggregatorHandle,
        layout: LayoutModel,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let handle_filter = warp::any().map(move || handle.clone());
        let layout_filter = warp::any().map(move || layout.clone());

        let locations = warp::path("locations")
            .and(warp::path::end())
            .and(warp::get())
            .and(handle_filter.clone())
            .and_then(|handle: AggregatorHandle| async move {
                handle
                    .locations()
                    .await
                    .map(|table| warp::reply::json(&table))
                    .map_err(|_| warp::reject::custom(AggregatorUnavailable))
            });

        let archive = warp::path("archive")
            .and(warp::path::end())
            .and(warp::get())
            .and(handle_filter.clone())
            .and_then(|handle: AggregatorHandle| async move {
                handle
                    .archive()
                    .await
                    .map(|archive| warp::reply::json(&archive))
                    .map_err(|_| warp::reject::custom(AggregatorUnavailable))
            });

        let status = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .and(handle_filter)
            .and(layout_filter)
            .and_then(|handle: AggregatorHandle, layout: LayoutModel| async move {
                handle
                    .status()
                    .await
                    .map(|status| warp::reply::json(&StatusModel { layout, status }))
                    .map_err(|_| warp::reject::custom(AggregatorUnavailable))
            });

        locations.or(archive).or(status)
    }

    /// Binds and serves until `cancel` fires. Returns the bound address.
    pub fn spawn(
        self,
        handle: AggregatorHandle,
        cancel: CancellationToken,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let routes = Self::routes(handle, self.layout);
        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(self.addr, async move { cancel.cancelled().await })
            .with_context(|| format!("binding status bridge on {}", self.addr))?;
        log::info!("Status bridge listening on http://{}", addr);
        Ok((addr, tokio::spawn(server)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trackcore::processing::{Aggregator, RatioEstimator};
    use trackcore::telemetry::MetricsRecorder;
    use trackcore::wire::LineParser;
    use trackcore::wire::ParseOutcome;
    use trackcore::{AnchorMap, EngineConfig};

    fn running_aggregator() -> (AggregatorHandle, LayoutModel, CancellationToken) {
        let config = EngineConfig::new(3, 10.0, AnchorMap::from_ordered(["a", "b", "c"]));
        let aggregator = Aggregator::new(
            &config,
            Box::new(RatioEstimator::new(10.0)),
            Arc::new(MetricsRecorder::new()),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let (handle, _task) = aggregator.spawn(16, shutdown.clone());
        (handle, LayoutModel::from_engine(&config), shutdown)
    }

    #[tokio::test]
    async fn locations_route_serves_estimates() {
        let (handle, layout, _shutdown) = running_aggregator();
        let parser = LineParser::unfiltered();
        for (source, strength) in [("a", -40), ("b", -60), ("c", -50)] {
            let line = format!("AA:BB:CC:DD:EE:FF {} 1a2b3c", strength);
            if let ParseOutcome::Accepted(reading) = parser.parse(line.as_bytes(), source).unwrap() {
                handle.submit(reading).await.unwrap();
            }
        }

        let routes = StatusBridge::routes(handle, layout);
        let response = warp::test::request()
            .method("GET")
            .path("/locations")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["AA:BB:CC:DD:EE:FF"]["observationCount"], 1);
        assert_eq!(body["AA:BB:CC:DD:EE:FF"]["x"], 4.0);
    }

    #[tokio::test]
    async fn status_route_includes_layout() {
        let (handle, layout, _shutdown) = running_aggregator();
        let routes = StatusBridge::routes(handle, layout);
        let response = warp::test::request()
            .method("GET")
            .path("/status")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["layout"]["anchors"].as_array().unwrap().len(), 3);
        assert_eq!(body["status"]["receivers"], 3);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (handle, layout, _shutdown) = running_aggregator();
        let routes = StatusBridge::routes(handle, layout);
        let response = warp::test::request()
            .method("GET")
            .path("/payload")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn stopped_aggregator_is_a_server_error() {
        let (handle, layout, shutdown) = running_aggregator();
        shutdown.cancel();
        for _ in 0..100 {
            if handle.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let routes = StatusBridge::routes(handle, layout);
        let response = warp::test::request()
            .method("GET")
            .path("/archive")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 500);
    }
}
