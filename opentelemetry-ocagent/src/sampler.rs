use std::sync::{Arc, RwLock};

use opentelemetry::trace::{Link, SamplingResult, SpanKind, TraceId};
use opentelemetry::{otel_debug, Context, KeyValue};
use opentelemetry_sdk::trace::{Sampler, ShouldSample};

use crate::proto::trace::v1::{constant_sampler::ConstantDecision, trace_config, TraceConfig};

/// A sampler the agent can reconfigure at runtime.
///
/// Install it on the tracer provider; every configuration the agent pushes on
/// the config stream replaces the sampler it delegates to. All clones share
/// the same delegate.
///
/// ```no_run
/// # async fn install(exporter: &opentelemetry_ocagent::OcAgentExporter) {
/// let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
///     .with_sampler(exporter.sampler())
///     .build();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct AgentSampler {
    current: Arc<RwLock<Sampler>>,
}

impl AgentSampler {
    pub(crate) fn new(initial: Sampler) -> Self {
        AgentSampler {
            current: Arc::new(RwLock::new(initial)),
        }
    }

    /// Apply a configuration pushed by the agent. Returns whether the
    /// delegate was replaced; unknown or absent samplers leave it untouched.
    pub(crate) fn apply(&self, config: &TraceConfig) -> bool {
        let Some(sampler) = config.sampler.as_ref().and_then(sampler_from_config) else {
            otel_debug!(name: "OcAgent.Sampler.Unchanged");
            return false;
        };

        otel_debug!(name: "OcAgent.Sampler.Replaced", sampler = format!("{:?}", sampler));
        match self.current.write() {
            Ok(mut current) => *current = sampler,
            Err(poisoned) => *poisoned.into_inner() = sampler,
        }
        true
    }
}

fn sampler_from_config(config: &trace_config::Sampler) -> Option<Sampler> {
    match config {
        trace_config::Sampler::ProbabilitySampler(probability) => Some(
            Sampler::TraceIdRatioBased(probability.sampling_probability),
        ),
        trace_config::Sampler::ConstantSampler(constant) => {
            if constant.decision == ConstantDecision::AlwaysOn as i32 {
                Some(Sampler::AlwaysOn)
            } else {
                Some(Sampler::AlwaysOff)
            }
        }
        // TODO: map to a rate limiting sampler once the sdk provides one
        trace_config::Sampler::RateLimitingSampler(_) => None,
    }
}

impl ShouldSample for AgentSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        current.should_sample(parent_context, trace_id, name, span_kind, attributes, links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::trace::v1::{ConstantSampler, ProbabilitySampler, RateLimitingSampler};
    use opentelemetry::trace::SamplingDecision;

    fn decision(sampler: &AgentSampler) -> SamplingDecision {
        sampler
            .should_sample(
                None,
                TraceId::from(0x0123_4567_89ab_cdef_0123_4567_89ab_cdefu128),
                "op",
                &SpanKind::Internal,
                &[],
                &[],
            )
            .decision
    }

    fn config(sampler: trace_config::Sampler) -> TraceConfig {
        TraceConfig {
            sampler: Some(sampler),
            ..Default::default()
        }
    }

    #[test]
    fn test_constant_decisions() {
        let sampler = AgentSampler::new(Sampler::AlwaysOn);
        assert_eq!(decision(&sampler), SamplingDecision::RecordAndSample);

        assert!(sampler.apply(&config(trace_config::Sampler::ConstantSampler(
            ConstantSampler {
                decision: ConstantDecision::AlwaysOff as i32,
            }
        ))));
        assert_eq!(decision(&sampler), SamplingDecision::Drop);

        assert!(sampler.apply(&config(trace_config::Sampler::ConstantSampler(
            ConstantSampler {
                decision: ConstantDecision::AlwaysOn as i32,
            }
        ))));
        assert_eq!(decision(&sampler), SamplingDecision::RecordAndSample);

        // anything but always-on means never
        assert!(sampler.apply(&config(trace_config::Sampler::ConstantSampler(
            ConstantSampler {
                decision: ConstantDecision::AlwaysParent as i32,
            }
        ))));
        assert_eq!(decision(&sampler), SamplingDecision::Drop);
    }

    #[test]
    fn test_probability() {
        let sampler = AgentSampler::new(Sampler::AlwaysOn);
        assert!(sampler.apply(&config(trace_config::Sampler::ProbabilitySampler(
            ProbabilitySampler {
                sampling_probability: 0.0,
            }
        ))));
        assert_eq!(decision(&sampler), SamplingDecision::Drop);

        sampler.apply(&config(trace_config::Sampler::ProbabilitySampler(
            ProbabilitySampler {
                sampling_probability: 1.0,
            }
        )));
        assert_eq!(decision(&sampler), SamplingDecision::RecordAndSample);
    }

    #[test]
    fn test_unknown_sampler_keeps_current() {
        let sampler = AgentSampler::new(Sampler::AlwaysOff);
        assert!(!sampler.apply(&config(
            trace_config::Sampler::RateLimitingSampler(RateLimitingSampler { qps: 10 })
        )));
        assert!(!sampler.apply(&TraceConfig::default()));
        assert_eq!(decision(&sampler), SamplingDecision::Drop);
    }

    #[test]
    fn test_clones_share_the_delegate() {
        let sampler = AgentSampler::new(Sampler::AlwaysOn);
        let installed = sampler.clone();
        sampler.apply(&config(trace_config::Sampler::ConstantSampler(
            ConstantSampler {
                decision: ConstantDecision::AlwaysOff as i32,
            },
        )));
        assert_eq!(decision(&installed), SamplingDecision::Drop);
    }
}
