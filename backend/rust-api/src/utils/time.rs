use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson::Bson;

/// Timestamp representation for raw `doc!` updates. Typed inserts go through
/// chrono's serde impl, which writes RFC 3339 strings; raw updates must use
/// the same representation or reads through the typed models break.
pub fn chrono_to_bson(dt: DateTime<Utc>) -> Bson {
    Bson::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}
