//! The config stream: the agent pushes trace configurations, the exporter
//! applies them to its sampler and echoes what it applied.
use opentelemetry::{otel_debug, otel_info};

use crate::proto::agent::trace::v1::{CurrentLibraryConfig, UpdatedLibraryConfig};
use crate::proto::trace::v1::TraceConfig;
use crate::sampler::AgentSampler;
use crate::transport::{StreamReceiver, StreamSender};

/// Serve one config stream until it fails.
///
/// Failures end the loop and are only logged; the connection state is left
/// to the export streams, and the next connection opens a new config stream.
pub(crate) async fn run(
    mut sender: Box<dyn StreamSender<CurrentLibraryConfig>>,
    mut receiver: Box<dyn StreamReceiver<UpdatedLibraryConfig>>,
    sampler: AgentSampler,
) {
    loop {
        let update = match receiver.recv().await {
            Ok(update) => update,
            Err(err) => {
                otel_debug!(name: "OcAgent.ConfigStream.Ended", reason = format!("{}", err));
                return;
            }
        };
        let Some(config) = update.config else {
            continue;
        };

        if sampler.apply(&config) {
            otel_info!(name: "OcAgent.ConfigStream.SamplerApplied");
        }

        let applied = CurrentLibraryConfig {
            node: None,
            config: Some(TraceConfig {
                sampler: config.sampler,
                ..Default::default()
            }),
        };
        if let Err(err) = sender.send(&applied).await {
            otel_debug!(name: "OcAgent.ConfigStream.AckFailed", reason = format!("{}", err));
            return;
        }
    }
}
