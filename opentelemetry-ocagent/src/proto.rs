//! Generated types for the OpenCensus agent protocol.
//!
//! The files under `proto/tonic` are checked in so that building the crate
//! does not require `protoc`.
#![allow(clippy::all, missing_docs, rustdoc::invalid_html_tags)]

pub mod agent {
    pub mod common {
        pub mod v1 {
            include!("proto/tonic/opencensus.proto.agent.common.v1.rs");
        }
    }

    pub mod metrics {
        pub mod v1 {
            include!("proto/tonic/opencensus.proto.agent.metrics.v1.rs");
        }
    }

    pub mod trace {
        pub mod v1 {
            include!("proto/tonic/opencensus.proto.agent.trace.v1.rs");
        }
    }
}

pub mod metrics {
    pub mod v1 {
        include!("proto/tonic/opencensus.proto.metrics.v1.rs");
    }
}

pub mod resource {
    pub mod v1 {
        include!("proto/tonic/opencensus.proto.resource.v1.rs");
    }
}

pub mod trace {
    pub mod v1 {
        include!("proto/tonic/opencensus.proto.trace.v1.rs");
    }
}
