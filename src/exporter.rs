//! Streams table rows through an encoder into a storage backend
//!
//! The exporter owns the abort-and-cleanup path: any failure after the
//! artifact writer is opened (encoding, backend I/O, cancellation, an
//! upstream error carried by the row stream) aborts the writer so nothing
//! readable is left at the destination.

use crate::context::ExportContext;
use crate::dataframe::{DataFrameRow, DataFrameSchema};
use crate::encoder::{Encoder, EncoderWriter};
use crate::storage::{ArtifactWriter, Destination, StorageBackend};
use crate::{Result, Stage};

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Outcome of a committed export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub destination: Destination,
    /// Series that contributed at least one row
    pub series: usize,
    pub rows: u64,
    /// Size of the committed artifact
    pub bytes: u64,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} series, {} rows, {} bytes)",
            self.destination, self.series, self.rows, self.bytes
        )
    }
}

/// Writes one artifact per export
#[derive(Clone)]
pub struct Exporter {
    encoder: Arc<dyn Encoder>,
    backend: Arc<dyn StorageBackend>,
}

impl Exporter {
    pub fn new(encoder: Arc<dyn Encoder>, backend: Arc<dyn StorageBackend>) -> Self {
        Self { encoder, backend }
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Encode `rows` and commit them to `destination`.
    ///
    /// Rows are written in stream order. The artifact only becomes visible
    /// once every row is encoded and the backend commit succeeds.
    pub async fn export<S>(
        &self,
        ctx: &ExportContext,
        destination: &Destination,
        schema: &DataFrameSchema,
        rows: S,
    ) -> Result<ExportSummary>
    where
        S: Stream<Item = Result<DataFrameRow>> + Send,
    {
        self.export_inner(ctx, destination, schema, rows)
            .instrument(ctx.span().clone())
            .await
    }

    async fn export_inner<S>(
        &self,
        ctx: &ExportContext,
        destination: &Destination,
        schema: &DataFrameSchema,
        rows: S,
    ) -> Result<ExportSummary>
    where
        S: Stream<Item = Result<DataFrameRow>> + Send,
    {
        let session = self
            .encoder
            .open(schema)
            .map_err(|e| e.in_stage(Stage::Encode))?;

        let mut artifact = ctx
            .guard(self.backend.open_writer(destination))
            .await
            .and_then(|opened| opened)
            .map_err(|e| e.in_stage(Stage::Upload))?;

        debug!(
            destination = %destination,
            backend = %self.backend.describe(),
            format = self.encoder.format(),
            columns = schema.num_columns(),
            "Opened artifact"
        );

        let mut progress = Progress::default();
        let outcome = drive(ctx, session, artifact.as_mut(), rows, &mut progress).await;

        if let Err(e) = outcome {
            warn!(
                destination = %destination,
                rows = progress.rows,
                error = %e,
                "Export failed, aborting artifact"
            );
            if let Err(abort_err) = artifact.abort().await {
                warn!(
                    destination = %destination,
                    error = %abort_err,
                    "Failed to abort artifact"
                );
            }
            return Err(e);
        }

        artifact
            .commit()
            .await
            .map_err(|e| e.in_stage(Stage::Upload))?;

        let summary = ExportSummary {
            destination: destination.clone(),
            series: progress.series,
            rows: progress.rows,
            bytes: progress.bytes,
        };
        info!(
            destination = %summary.destination,
            series = summary.series,
            rows = summary.rows,
            bytes = summary.bytes,
            "Committed artifact"
        );
        Ok(summary)
    }
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("format", &self.encoder.format())
            .field("backend", &self.backend.describe())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Progress {
    series: usize,
    rows: u64,
    bytes: u64,
    last_labels: Option<Arc<[Option<String>]>>,
}

impl Progress {
    fn record(&mut self, row: &DataFrameRow) {
        let same_series = self
            .last_labels
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &row.labels));
        if !same_series {
            self.series += 1;
            self.last_labels = Some(Arc::clone(&row.labels));
        }
        self.rows += 1;
    }
}

/// Feed every row through `session`, streaming finalized bytes into
/// `artifact`. Returns once the encoder is closed and its tail written.
async fn drive<S>(
    ctx: &ExportContext,
    mut session: Box<dyn EncoderWriter>,
    artifact: &mut dyn ArtifactWriter,
    rows: S,
    progress: &mut Progress,
) -> Result<()>
where
    S: Stream<Item = Result<DataFrameRow>> + Send,
{
    futures::pin_mut!(rows);

    loop {
        let next = ctx
            .guard(rows.next())
            .await
            .map_err(|e| e.in_stage(Stage::Read))?;
        let Some(row) = next else {
            break;
        };
        let row = row?;

        session
            .write_row(&row)
            .map_err(|e| e.in_stage(Stage::Encode))?;
        progress.record(&row);

        let encoded = session.take_encoded();
        upload(ctx, artifact, encoded, progress).await?;
    }

    let tail = session.close().map_err(|e| e.in_stage(Stage::Encode))?;
    upload(ctx, artifact, tail, progress).await?;

    ctx.check().map_err(|e| e.in_stage(Stage::Upload))
}

async fn upload(
    ctx: &ExportContext,
    artifact: &mut dyn ArtifactWriter,
    bytes: Bytes,
    progress: &mut Progress,
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let len = bytes.len() as u64;
    ctx.guard(artifact.write(bytes))
        .await
        .and_then(|written| written)
        .map_err(|e| e.in_stage(Stage::Upload))?;
    progress.bytes += len;
    Ok(())
}
