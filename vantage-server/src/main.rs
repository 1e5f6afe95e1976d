use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, Result};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use vantage_core::StreamRegistry;
use vantage_server::capture::CaptureWorker;
use vantage_server::config::AppConfig;
use vantage_server::files::FileStore;
use vantage_server::media::ffmpeg::{self, Mp4ContainerOpener, RtspSourceOpener};
use vantage_server::recorder::{RecorderSettings, RecorderWorker};
use vantage_server::Cli;

use web::{AppState, StreamHandle, Web};

mod web;

#[tokio::main]
async fn main() -> Result<()> {
    let (args, ignored_args) = Cli::parse_lenient();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    log::info!("vantage-server {}", vantage_server::VERSION);
    for arg in &ignored_args {
        log::warn!("unknown argument '{}' ignored", arg);
    }

    ffmpeg::init().into_diagnostic()?;

    let config = AppConfig::load(&args.config).into_diagnostic()?;
    log::info!(
        "loaded {} stream(s), recording to {}",
        config.streams.len(),
        config.rec_base_folder
    );

    Toplevel::new(move |s| async move {
        let registry = StreamRegistry::new();
        // Preview fan-out for an attached display; nothing in this process
        // renders, external sinks subscribe.
        let (preview_tx, _) = tokio::sync::broadcast::channel(64);

        let mut streams = HashMap::new();

        for stream in &config.streams {
            registry.register(&stream.id);

            let settings = RecorderSettings {
                pre_roll_seconds: config.pre_buffering_time,
                post_roll_seconds: config.post_buffering_time,
                folder_base: config.rec_base(),
            };
            let (recorder, recorder_tx) = RecorderWorker::new(
                &stream.id,
                settings,
                Mp4ContainerOpener,
                registry.clone(),
            );
            let (capture, control) = CaptureWorker::new(
                &stream.id,
                &stream.url,
                RtspSourceOpener,
                registry.clone(),
                recorder_tx.clone(),
                preview_tx.clone(),
                config.display_mode == 1,
            );

            if config.autostart == 1 {
                control.enable();
            }

            streams.insert(
                stream.id.clone(),
                StreamHandle {
                    capture: control,
                    recorder: recorder_tx,
                },
            );

            s.start(SubsystemBuilder::new(
                format!("recorder:{}", stream.id),
                move |subsys| recorder.run(subsys),
            ));
            s.start(SubsystemBuilder::new(
                format!("capture:{}", stream.id),
                move |subsys| capture.run(subsys),
            ));
        }

        let state = Arc::new(AppState {
            registry,
            streams,
            store: FileStore::new(config.rec_base()),
        });
        // Range-checked during config load.
        let server = Web::new(state, config.http_port as u16);
        s.start(SubsystemBuilder::new("web", move |subsys| {
            server.run(subsys)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(Into::into)
}
