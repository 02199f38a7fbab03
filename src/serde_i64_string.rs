//! Serialize i64 message ids as JSON strings (JS safe integer range).

use serde::{Serialize, Serializer};

pub fn serialize<S>(value: &i64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    value.to_string().serialize(serializer)
}
