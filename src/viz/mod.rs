//! Visualization backends
//!
//! A backend receives samples from a reader callback and presents them.
//! Backends are selected at runtime by tag through [`create_backend`];
//! a recognised tag whose implementation is not available in this build
//! fails at construction rather than on first use.

pub mod web;

pub use web::WebBackend;

use crate::config::VisualizationConfig;
use crate::constants::{DEFAULT_HTTP_PORT, DEFAULT_READER_BUFFER};
use crate::error::VisualizationError;
use crate::types::{Sample, StreamDescriptor};

/// Every tag [`create_backend`] recognises
pub const KNOWN_BACKENDS: [&str; 3] = ["mne-lsl", "pyqt5", "web"];

/// Presentation sink for one stream
pub trait VisualizationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self) -> Result<(), VisualizationError>;

    /// Safe to call when not running
    fn stop(&self);

    /// Present one sample; ignored while stopped
    fn update(&self, sample: &Sample);

    /// Bind to a stream; connected viewers are told about the change
    fn set_stream(&self, descriptor: StreamDescriptor);

    fn stream(&self) -> Option<StreamDescriptor>;

    fn is_running(&self) -> bool;
}

/// Construction options shared by all backends
#[derive(Debug, Clone)]
pub struct VizOptions {
    /// Samples kept for display
    pub buffer_size: usize,
    /// Refreshes per second
    pub update_rate: f64,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for VizOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_READER_BUFFER,
            update_rate: 30.0,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl From<&VisualizationConfig> for VizOptions {
    fn from(config: &VisualizationConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            update_rate: config.update_rate,
            bind_address: config.bind_address.clone(),
            http_port: config.http_port,
        }
    }
}

/// Build the backend named by `tag` (case-insensitive)
pub fn create_backend(
    tag: &str,
    descriptor: Option<StreamDescriptor>,
    options: VizOptions,
) -> Result<Box<dyn VisualizationBackend>, VisualizationError> {
    let backend: Box<dyn VisualizationBackend> = match tag.trim().to_lowercase().as_str() {
        "web" => Box::new(WebBackend::new(options)),
        "mne-lsl" => {
            return Err(VisualizationError::Unavailable {
                backend: "MNE".to_string(),
                reason: "the MNE-LSL viewer has no native implementation".to_string(),
            })
        }
        "pyqt5" => {
            return Err(VisualizationError::Unavailable {
                backend: "PyQt5".to_string(),
                reason: "desktop plotting is not built into this binary".to_string(),
            })
        }
        _ => return Err(VisualizationError::UnknownBackend(tag.to_string())),
    };

    if let Some(descriptor) = descriptor {
        backend.set_stream(descriptor);
    }
    Ok(backend)
}

/// Tags that [`create_backend`] can construct in this build
pub fn available_backends() -> Vec<&'static str> {
    vec!["web"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelFormat;

    #[test]
    fn test_create_web_backend() {
        let descriptor = StreamDescriptor::new("EEG", "EEG", 4, 250.0, ChannelFormat::Float32);
        let backend = create_backend("WEB", Some(descriptor.clone()), VizOptions::default()).unwrap();
        assert_eq!(backend.name(), "web");
        assert_eq!(backend.stream(), Some(descriptor));
        assert!(!backend.is_running());
    }

    #[test]
    fn test_unavailable_and_unknown_backends() {
        assert!(matches!(
            create_backend("mne-lsl", None, VizOptions::default()),
            Err(VisualizationError::Unavailable { .. })
        ));
        assert!(matches!(
            create_backend("pyqt5", None, VizOptions::default()),
            Err(VisualizationError::Unavailable { .. })
        ));
        assert!(matches!(
            create_backend("matplotlib", None, VizOptions::default()),
            Err(VisualizationError::UnknownBackend(tag)) if tag == "matplotlib"
        ));
    }

    #[test]
    fn test_available_backends_are_known() {
        for tag in available_backends() {
            assert!(KNOWN_BACKENDS.contains(&tag));
            assert!(create_backend(tag, None, VizOptions::default()).is_ok());
        }
    }
}
