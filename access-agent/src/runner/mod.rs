//! Process wiring for the access-agent binary.
//!
//! Builds every stage from configuration, failing fast on setup errors, then runs until
//! Ctrl-C or until the line source fails.

use crate::config::{Config, SinkTarget};
use crate::influx_client::InfluxSink;
use crate::output_writer::{FileWriter, Precision, RecordSink};
use crate::parsers::{AccessLogParser, Parser};
use crate::pipeline::{join_or_abort, Pipeline, PipelineSettings};
use crate::status_server;
use crate::tailer::LineSource;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Build the record sink selected by `[sink]`.
///
/// Returns either an InfluxSink (HTTP line protocol) or a FileWriter (local output).
pub async fn build_record_sink(config: &Config) -> Result<Arc<dyn RecordSink>> {
    match config.sink_target()? {
        SinkTarget::Influx(dsn) => {
            let sink = InfluxSink::new(&dsn, config.request_timeout())
                .context("failed to build influx sink")?;

            info!(
                endpoint = %dsn.endpoint,
                database = %dsn.database,
                precision = %dsn.precision,
                "configured influx sink"
            );

            Ok(Arc::new(sink))
        }
        SinkTarget::File(path) => {
            let writer = FileWriter::open(&path, Precision::default()).await?;

            info!(
                output_path = %path.display(),
                "configured local file output sink"
            );

            Ok(Arc::new(writer))
        }
    }
}

/// Run the agent until a shutdown signal or a fatal source error.
pub async fn run(config: &Config) -> Result<()> {
    info!("access-agent starting");

    let time_zone = config.time_zone()?;
    let listen_addr = config.listen_addr()?;
    let settings = PipelineSettings::from_config(config);
    let record_sink = build_record_sink(config).await?;
    let source = LineSource::open(config.source_path()).await?;
    let source_path = source.path().to_path_buf();
    let listener = status_server::bind(listen_addr).await?;

    let cancel_token = CancellationToken::new();
    let access_log_parser = AccessLogParser::new(time_zone);
    info!(time_zone = %access_log_parser.time_zone(), "configured access log parser");
    let parser: Arc<dyn Parser> = Arc::new(access_log_parser);
    let mut pipeline = Pipeline::start(
        source,
        parser,
        record_sink,
        &settings,
        cancel_token.clone(),
    );
    let server_handle = tokio::spawn(status_server::serve(
        listener,
        pipeline.monitor(),
        cancel_token.clone(),
    ));

    info!(path = %source_path.display(), "access-agent started; tailing");

    let outcome = tokio::select! {
        result = pipeline.source_finished() => result,
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed while waiting for shutdown signal");
            }
            info!("shutdown signal received");
            Ok(())
        }
    };

    if let Err(err) = &outcome {
        error!(error = %format!("{err:#}"), "pipeline failed; shutting down");
    }

    info!("initiating shutdown");
    cancel_token.cancel();
    pipeline.shutdown().await;
    join_or_abort("status-server", server_handle).await;

    outcome
}
