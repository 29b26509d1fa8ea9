pub mod convert;
pub mod error;
pub mod types;

pub use error::{Error, Result};

/// Generated protocol bindings.
pub mod proto {
    /// The service exposed to gateways.
    pub mod categorization {
        tonic::include_proto!("inboxpert.categorization.v1");
    }

    /// The ML backend consumed by the categorizer.
    pub mod prediction {
        tonic::include_proto!("inboxpert.prediction.v1");
    }

    /// Encoded descriptors for both packages, registered with gRPC
    /// reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("inboxpert_descriptor");
}
