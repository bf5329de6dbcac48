//! Shared building blocks of the Axon ML service.
//!
//! Everything that crosses a crate boundary lives here: tensor shape
//! descriptors and data bundles, the tagged information maps used for
//! configuration and event payloads, the service event callback slot, and
//! the boundary error type with its stable integer codes.

pub mod data;
pub mod error;
pub mod event;
pub mod info;
pub mod tensor;

pub use data::TensorsData;
pub use error::{Result, ServiceError};
pub use event::{EventCallback, EventSink, ServiceEvent, ServiceEventKind};
pub use info::{InfoKind, InfoValue, InformationList, InformationMap};
pub use tensor::{ElementType, TensorInfo, TensorsInfo, LEGACY_RANK, MAX_RANK, MAX_TENSOR_COUNT};
