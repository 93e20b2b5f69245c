//! Wire protocol for repliq.
//!
//! This crate defines the language nodes speak:
//!
//! - **Values** ([`Value`], [`ValueType`]): the closed set of types a
//!   property, argument or model cell can hold.
//! - **Capability maps** ([`CapabilityMap`]): the static, index-addressed
//!   description of a remotable type, and its [`ObjectSignature`].
//! - **Packets** ([`Packet`]): the messages that travel in each frame.
//! - **Codecs** ([`Codec`], [`JsonCodec`], [`BinaryCodec`]): how packets
//!   become bytes.
//!
//! ```text
//! Transport (frames) → Protocol (Packet) → Source / Replica / Model
//! ```

mod api;
mod codec;
mod error;
mod packet;
mod signature;
mod value;

pub use api::{
    CapabilityMap, CapabilityMapBuilder, EnumDef, MethodDef, ParamDef, PropertyDef,
    PropertyModifier, SignalDef,
};
#[cfg(feature = "binary")]
pub use codec::BinaryCodec;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use packet::{
    Cell, CellData, IndexPath, ItemFlags, ObjectInfo, Orientation, Packet, Role, RowData,
    SourceLocation, PROTOCOL_VERSION,
};
pub use signature::{compute as compute_signature, ObjectSignature};
pub use value::{Value, ValueType};
