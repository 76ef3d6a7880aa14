//! End-to-end export: read → discover schema → aggregate → build → export

use crate::aggregate::{aggregate, AggregationConfig};
use crate::context::ExportContext;
use crate::dataframe::{DataFrameBuilder, DataFrameSchema};
use crate::encoder::Encoder;
use crate::exporter::{ExportSummary, Exporter};
use crate::series::{ReadParams, SeriesReader};
use crate::storage::{Destination, StorageBackend};
use crate::{Result, Stage};

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, Instrument};

/// Everything one export needs besides its collaborators
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub params: ReadParams,
    pub aggregation: AggregationConfig,
    pub destination: Destination,
}

impl ExportRequest {
    pub fn new(params: ReadParams, aggregation: AggregationConfig, destination: Destination) -> Self {
        Self {
            params,
            aggregation,
            destination,
        }
    }
}

/// Wires a series source, an encoder and a storage backend together
#[derive(Clone)]
pub struct Pipeline {
    reader: Arc<dyn SeriesReader>,
    exporter: Exporter,
}

impl Pipeline {
    pub fn new(
        reader: Arc<dyn SeriesReader>,
        backend: Arc<dyn StorageBackend>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self {
            reader,
            exporter: Exporter::new(encoder, backend),
        }
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Run one export.
    ///
    /// The schema is fixed from the matched series' label sets before any
    /// sample is consumed. Workers spawned for aggregation run under a child
    /// of `ctx` that is cancelled when this call returns, whatever the
    /// outcome.
    pub async fn run(&self, ctx: &ExportContext, request: &ExportRequest) -> Result<ExportSummary> {
        self.run_inner(ctx, request)
            .instrument(ctx.span().clone())
            .await
    }

    async fn run_inner(&self, ctx: &ExportContext, request: &ExportRequest) -> Result<ExportSummary> {
        let started = Instant::now();
        info!(
            destination = %request.destination,
            min_time_ms = request.params.min_time_ms,
            max_time_ms = request.params.max_time_ms,
            window_ms = request.aggregation.window_ms(),
            "Starting export"
        );

        let series_set = ctx
            .guard(self.reader.read(ctx, &request.params))
            .await
            .and_then(|read| read)
            .map_err(|e| e.in_stage(Stage::Read))?;

        let schema = DataFrameSchema::discover(&series_set, &request.aggregation)
            .map_err(|e| e.in_stage(Stage::Build))?;
        info!(
            series = series_set.len(),
            columns = schema.num_columns(),
            "Resolved series"
        );

        let (worker_ctx, _workers) = ctx.child();
        let buckets = aggregate(series_set, &request.aggregation, &worker_ctx);
        let rows = DataFrameBuilder::new(schema.clone()).build(buckets);

        let summary = self
            .exporter
            .export(&worker_ctx, &request.destination, &schema, rows)
            .await?;

        info!(
            destination = %summary.destination,
            series = summary.series,
            rows = summary.rows,
            bytes = summary.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Export complete"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("exporter", &self.exporter)
            .finish_non_exhaustive()
    }
}
