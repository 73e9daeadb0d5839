pub mod config;
pub mod instance;
pub mod locator;
pub mod service;

pub use config::{AddressKind, CloudSettings, Document, MtdSection, MtdSettings, SelectionKind};
pub use instance::{
    CloudInstance, ImageDetails, ImageRequest, ImageState, InstanceDetails, InstanceState,
    LaunchSpec,
};
pub use locator::CloudLocator;
pub use service::{Service, ServiceId};
