//! Identity of the exporting process and the resource it runs on.
//!
//! Both are sent once per stream, in the first message.
use std::collections::HashMap;
use std::env;
use std::time::SystemTime;

use crate::proto::agent::common::v1::{library_info, LibraryInfo, Node, ProcessIdentifier, ServiceInfo};
use crate::proto::resource::v1::Resource;
use crate::transform::metrics::to_timestamp;

/// Host name of the machine running the process.
pub const HOSTNAME: &str = "HOSTNAME";
/// Type of the resource the process runs on, e.g. `k8s.io/container`.
pub const OC_RESOURCE_TYPE: &str = "OC_RESOURCE_TYPE";
/// Resource labels, formatted as `key1=value1,key2="value2"`.
pub const OC_RESOURCE_LABELS: &str = "OC_RESOURCE_LABELS";

/// Build the node of this process.
///
/// `start_time` is captured once when the exporter is built and reused for
/// every connection.
pub(crate) fn node_with_start_time(service_name: &str, start_time: SystemTime) -> Node {
    Node {
        identifier: Some(ProcessIdentifier {
            host_name: env::var(HOSTNAME).unwrap_or_default(),
            pid: std::process::id(),
            start_timestamp: Some(to_timestamp(start_time)),
        }),
        library_info: Some(LibraryInfo {
            language: library_info::Language::Unspecified as i32,
            exporter_version: env!("CARGO_PKG_VERSION").to_string(),
            // no core library version is known at runtime
            core_library_version: String::new(),
        }),
        service_info: Some(ServiceInfo {
            name: service_name.to_string(),
        }),
        attributes: HashMap::new(),
    }
}

/// Convert an sdk resource; every attribute becomes a label.
pub(crate) fn resource_from_sdk(resource: &opentelemetry_sdk::Resource) -> Option<Resource> {
    if resource.is_empty() {
        return None;
    }

    Some(Resource {
        r#type: String::new(),
        labels: resource
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    })
}

/// Read the resource from `OC_RESOURCE_TYPE` and `OC_RESOURCE_LABELS`.
pub(crate) fn resource_from_env() -> Option<Resource> {
    let r#type = env::var(OC_RESOURCE_TYPE)
        .map(|value| value.trim().to_string())
        .unwrap_or_default();
    let labels = env::var(OC_RESOURCE_LABELS)
        .map(|value| parse_labels(&value))
        .unwrap_or_default();

    if r#type.is_empty() && labels.is_empty() {
        None
    } else {
        Some(Resource { r#type, labels })
    }
}

/// Parse `key1=value1,key2="value2"`. Entries without `=` or with an empty
/// key are skipped.
fn parse_labels(input: &str) -> HashMap<String, String> {
    input
        .split_terminator(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::KeyValue;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_node_identity() {
        temp_env::with_var(HOSTNAME, Some("web-1"), || {
            let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
            let node = node_with_start_time("checkout", start);

            let identifier = node.identifier.unwrap();
            assert_eq!(identifier.host_name, "web-1");
            assert_eq!(identifier.pid, std::process::id());
            assert_eq!(identifier.start_timestamp, Some(to_timestamp(start)));
            assert_eq!(node.service_info.unwrap().name, "checkout");
            let library = node.library_info.unwrap();
            assert_eq!(library.exporter_version, env!("CARGO_PKG_VERSION"));
            assert!(library.core_library_version.is_empty());
        });
    }

    #[test]
    fn test_resource_from_env() {
        temp_env::with_vars(
            [
                (OC_RESOURCE_TYPE, Some("k8s.io/container")),
                (
                    OC_RESOURCE_LABELS,
                    Some("pod = api-0, zone=\"us-east1\",broken,=empty"),
                ),
            ],
            || {
                let resource = resource_from_env().unwrap();
                assert_eq!(resource.r#type, "k8s.io/container");
                assert_eq!(
                    resource.labels,
                    HashMap::from([
                        ("pod".to_string(), "api-0".to_string()),
                        ("zone".to_string(), "us-east1".to_string()),
                    ])
                );
            },
        );
    }

    #[test]
    fn test_no_resource_when_env_is_empty() {
        temp_env::with_vars_unset([OC_RESOURCE_TYPE, OC_RESOURCE_LABELS], || {
            assert_eq!(resource_from_env(), None);
        });
    }

    #[test]
    fn test_resource_from_sdk() {
        let resource = opentelemetry_sdk::Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", "checkout"),
                KeyValue::new("replicas", 3_i64),
            ])
            .build();

        let converted = resource_from_sdk(&resource).unwrap();
        assert_eq!(converted.labels["service.name"], "checkout");
        assert_eq!(converted.labels["replicas"], "3");

        assert_eq!(
            resource_from_sdk(&opentelemetry_sdk::Resource::builder_empty().build()),
            None
        );
    }
}
