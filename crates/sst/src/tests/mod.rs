mod reader_tests;

use keycodec::{Key, Value};

/// Builds `(key, live value)` records with padded numeric keys so byte
/// order matches numeric order.
pub fn record(i: u64, sqn: u64) -> (Key, Value) {
    (
        format!("k{:06}", i).into_bytes(),
        Value::active(sqn, format!("meta-{}", i).into_bytes()),
    )
}
