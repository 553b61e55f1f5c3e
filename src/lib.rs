//! Reconstructs a deduplicated API endpoint catalog from captured browser
//! network traffic.
//!
//! Raw lifecycle events flow through the [`correlator::Correlator`], which
//! reassembles them into exchanges, keys them with the
//! [`templater::UrlTemplater`] and pulls credentials out with the
//! [`credentials::CredentialExtractor`]. Finalized exchanges are folded into
//! the [`catalog::EndpointCatalog`], labelled by the
//! [`taxonomy::Classifier`]. [`session::CaptureSession`] ties it together.

pub mod catalog;
pub mod cdp;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod credentials;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod session;
pub mod source;
pub mod taxonomy;
pub mod templater;
pub mod types;
pub mod walker;

pub use catalog::{EndpointCatalog, EndpointRecord};
pub use config::CaptureConfig;
pub use correlator::Correlator;
pub use credentials::CredentialExtractor;
pub use error::{CaptureError, Result};
pub use filter::{AcceptAll, TargetFilter, TrafficFilter};
pub use session::{CaptureSession, SessionBudget, SessionSummary, StopReason};
pub use source::{ChannelSource, EventSource, ReplaySource};
pub use taxonomy::Classifier;
pub use templater::UrlTemplater;
pub use types::{
    CanonicalKey, CredentialFragment, CredentialSource, EventFields, Exchange, ExchangeId,
    ExchangeState, LifecycleEvent, Phase,
};
