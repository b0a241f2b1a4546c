#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared request-shaping pieces of the `easel` dispatcher: the declared
//! parameter table with its validation rules, the round-trippable
//! acknowledgement codec, the per-user preferences store, and the static
//! chat-surface configuration.

pub mod ack;
pub mod params;
pub mod prefs;
pub mod surface;

pub use ack::AckError;
pub use params::{max_batch_size, ParamKind, ParamRegistry, ParamSet, ParamValue, PixelCeilings};
pub use prefs::PreferencesStore;
pub use surface::{BotConfig, Catalog, CatalogEntry, SurfaceEntry, DEFAULT_IN_FLIGHT_CAP};
