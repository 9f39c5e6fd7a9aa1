//! Pure helpers shared by the ExoneraTor importer and query engine.

pub mod dates;
pub mod networking;
